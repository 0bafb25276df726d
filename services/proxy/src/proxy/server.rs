//! The proxy instance.
//!
//! A [`Proxy`] owns everything one listening endpoint needs: route table,
//! identity store, modifier chain and connection registry. Several instances
//! can run in one process without sharing state.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use url::Url;

use crate::analyzer::{ExceptionListener, ExceptionListeners, LoggingSink, TrafficSink};
use crate::config::{DirectReverseProxyConfig, ModifierDescriptor, ProxyConfig, RouteSpec};
use crate::error::{ConfigError, ProxyError};
use crate::ids::RouteId;
use crate::proxy::connector::UpstreamConnector;
use crate::proxy::listener::{ConnectionAcceptor, ListenerStats};
use crate::proxy::modifier::{ModifierChain, ModifierRegistry};
use crate::proxy::registry::{ConnectionInfo, ConnectionRegistry, ConnectionStatus};
use crate::proxy::relay::{RelayContext, RelaySettings};
use crate::proxy::router::{RouteDescriptor, RouteResolver, SelfAddress, Target};
use crate::proxy::tls::{TlsIdentityStore, TlsInterceptor};

type EnvLookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Assembles a [`Proxy`] from configuration and injected collaborators.
pub struct ProxyBuilder {
    config: ProxyConfig,
    sink: Option<Arc<dyn TrafficSink>>,
    listeners: ExceptionListeners,
    modifier_registry: ModifierRegistry,
    env: EnvLookup,
}

impl ProxyBuilder {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            sink: None,
            listeners: ExceptionListeners::default(),
            modifier_registry: ModifierRegistry::with_builtins(),
            env: Box::new(|key| std::env::var(key).ok()),
        }
    }

    /// Where captured units go. Defaults to [`LoggingSink`].
    pub fn sink(mut self, sink: Arc<dyn TrafficSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Called with every non-benign error.
    pub fn exception_listener(mut self, listener: Arc<dyn ExceptionListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Plugin kinds available to `add_modifier`.
    pub fn modifier_registry(mut self, registry: ModifierRegistry) -> Self {
        self.modifier_registry = registry;
        self
    }

    /// Environment used to resolve a `$SYSTEM` forward proxy.
    pub fn env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.env = Box::new(lookup);
        self
    }

    /// Validate the configuration, bind and start accepting.
    pub async fn start(self) -> Result<Proxy, ProxyError> {
        let Self {
            config,
            sink,
            listeners,
            modifier_registry,
            env,
        } = self;
        config.validate()?;

        let forward_proxy = match &config.forward_proxy {
            Some(forward) => forward.resolve(&env)?,
            None => None,
        };
        let direct = config
            .direct_reverse_proxy
            .as_ref()
            .map(direct_target)
            .transpose()?;

        let store = Arc::new(TlsIdentityStore::from_settings(&config.tls)?);
        let tls = Arc::new(TlsInterceptor::new(
            &config.tls,
            Arc::clone(&store),
            config.handshake_timeout(),
        )?);

        let listener = TcpListener::bind((config.bind_address, config.port)).await?;
        let local_addr = listener.local_addr()?;

        let resolver = Arc::new(RouteResolver::new(
            SelfAddress {
                local_addr,
                hostnames: config.proxy_hostnames.clone(),
            },
            config.max_loop_hops,
        ));
        let connector = Arc::new(UpstreamConnector::new(
            Arc::clone(&resolver),
            Arc::clone(&tls),
            forward_proxy,
            config.connect_timeout(),
        ));
        let modifiers = Arc::new(ModifierChain::new(modifier_registry));
        let registry = ConnectionRegistry::new();

        for spec in &config.routes {
            register_route(&resolver, &store, spec.clone())?;
        }
        for descriptor in &config.modifiers {
            modifiers.add(descriptor.clone())?;
        }

        let ctx = Arc::new(RelayContext {
            resolver: Arc::clone(&resolver),
            connector,
            tls,
            modifiers: Arc::clone(&modifiers),
            sink: sink.unwrap_or_else(|| Arc::new(LoggingSink)),
            listeners,
            settings: RelaySettings {
                activate_tls_termination: config.activate_tls_termination,
                blocking_analysis: config.parsing_should_block_communication,
                sniff_timeout: config.sniff_timeout(),
                head_timeout: config.head_timeout(),
                linger: config.relay_linger(),
                capture_queue_capacity: config.capture_queue_capacity,
                direct,
            },
        });

        let acceptor = ConnectionAcceptor::new(listener, ctx, Arc::clone(&registry), config.max_connections)?;
        let stats = acceptor.stats();
        let accept_task = tokio::spawn(acceptor.run());

        info!(
            bind_addr = %local_addr,
            tls_termination = config.activate_tls_termination,
            blocking_analysis = config.parsing_should_block_communication,
            routes = resolver.table().len(),
            "Proxy started"
        );

        Ok(Proxy {
            local_addr,
            resolver,
            store,
            modifiers,
            registry,
            stats,
            accept_task,
        })
    }
}

fn direct_target(config: &DirectReverseProxyConfig) -> Result<Target, ConfigError> {
    let scheme = if config.tls { "tls" } else { "tcp" };
    let host = if config.hostname.contains(':') {
        format!("[{}]", config.hostname)
    } else {
        config.hostname.clone()
    };
    Url::parse(&format!("{scheme}://{host}:{}", config.port))
        .ok()
        .and_then(Target::from_url)
        .ok_or_else(|| ConfigError::invalid("direct_reverse_proxy.hostname", "is not a valid host"))
}

fn register_route(
    resolver: &RouteResolver,
    store: &TlsIdentityStore,
    spec: RouteSpec,
) -> Result<RouteId, ConfigError> {
    if let Some(identity) = &spec.tls_identity {
        if !store.identity_names().iter().any(|n| n == identity) {
            return Err(ConfigError::invalid(
                "tls_identity",
                format!("no server identity named '{identity}'"),
            ));
        }
    }

    let route = resolver.table().insert(spec)?;
    if let Some(identity) = &route.tls_identity {
        let hosts = route.served_hosts();
        if hosts.is_empty() {
            warn!(route_id = %route.id, "Route pins a TLS identity but names no host");
        }
        for host in hosts {
            if let Err(e) = store.set_route_override(&host, identity) {
                resolver.table().remove(&route.id);
                return Err(e);
            }
        }
    }
    Ok(route.id)
}

/// A running proxy. Dropping it stops the accept loop.
pub struct Proxy {
    local_addr: SocketAddr,
    resolver: Arc<RouteResolver>,
    store: Arc<TlsIdentityStore>,
    modifiers: Arc<ModifierChain>,
    registry: Arc<ConnectionRegistry>,
    stats: Arc<ListenerStats>,
    accept_task: JoinHandle<()>,
}

impl Proxy {
    pub fn builder(config: ProxyConfig) -> ProxyBuilder {
        ProxyBuilder::new(config)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Validate and add a route; it applies to connections routed afterwards.
    pub fn add_route(&self, spec: RouteSpec) -> Result<RouteId, ConfigError> {
        register_route(&self.resolver, &self.store, spec)
    }

    pub fn remove_route(&self, id: &RouteId) -> bool {
        let Some(route) = self.resolver.table().remove(id) else {
            return false;
        };
        if route.tls_identity.is_some() {
            for host in route.served_hosts() {
                self.store.clear_route_override(&host);
            }
        }
        true
    }

    /// All routes, starting with the control route for the proxy's own authority.
    pub fn routes(&self) -> Vec<RouteDescriptor> {
        self.resolver.descriptors()
    }

    pub fn add_modifier(&self, descriptor: ModifierDescriptor) -> Result<(), ConfigError> {
        self.modifiers.add(descriptor)
    }

    pub fn remove_modifier(&self, name: &str) -> bool {
        self.modifiers.remove(name)
    }

    pub fn modifiers(&self) -> Vec<ModifierDescriptor> {
        self.modifiers.descriptors()
    }

    pub fn open_connections(&self, status: Option<ConnectionStatus>) -> Vec<ConnectionInfo> {
        self.registry.list(status)
    }

    pub fn tls_identities(&self) -> &Arc<TlsIdentityStore> {
        &self.store
    }

    /// PEM of the CA that signs dynamically issued certificates.
    pub fn ca_certificate_pem(&self) -> String {
        self.store.authority().certificate_pem()
    }

    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Stop accepting. Connections already being relayed run to completion.
    pub async fn shutdown(self) {
        self.accept_task.abort();
        info!(bind_addr = %self.local_addr, "Proxy stopped");
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}
