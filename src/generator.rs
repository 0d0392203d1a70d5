use crate::aggregator::HeightState;
use crate::config::{Association, RoutingConfig};
use crate::registry::{Group, Method, Provider, Registry};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Priority of a group's loopback route. Method routes win over it.
pub const LOOPBACK_PRIORITY: u32 = 1;
pub const METHOD_PRIORITY: u32 = 2;

/// Complete dynamic routing configuration handed to the consumer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RoutingConfiguration {
    pub http: HttpConfiguration,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpConfiguration {
    pub routers: BTreeMap<String, Route>,
    pub middlewares: BTreeMap<String, Middleware>,
    pub services: BTreeMap<String, BackendPool>,
    pub servers_transports: BTreeMap<String, ServersTransport>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub entry_points: Vec<String>,
    pub service: String,
    pub rule: String,
    pub priority: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub middlewares: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendPool {
    pub load_balancer: LoadBalancer,
}

impl BackendPool {
    pub fn servers(&self) -> impl Iterator<Item = &str> {
        self.load_balancer.servers.iter().map(|s| s.url.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancer {
    pub strategy: Strategy,
    pub servers: Vec<Server>,
    pub pass_host_header: bool,
    pub servers_transport: String,
}

/// Equal-weight rotation across every listed server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Strategy {
    #[serde(rename = "wrr")]
    RoundRobin,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Server {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Middleware {
    pub plugin: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServersTransport {
    #[serde(rename = "disableHTTP2")]
    pub disable_http2: bool,
}

/// Output of one generation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub configuration: RoutingConfiguration,
    /// Pools that fell back to the unfiltered provider list.
    pub degraded: Vec<String>,
}

/// Builds routing configurations from the registry and a height snapshot.
pub struct Generator {
    registry: Arc<Registry>,
    settings: RoutingConfig,
}

/// Result of picking the servers for one pool.
struct Selection {
    servers: Vec<Server>,
    degraded: bool,
}

impl Generator {
    pub fn new(registry: Arc<Registry>, settings: RoutingConfig) -> Self {
        Self { registry, settings }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Generates the full configuration. `latest` is indexed by provider
    /// index; `None` means the provider has not reported yet.
    pub fn generate(&self, latest: &[Option<u64>], heights: &HeightState) -> Generation {
        let mut http = HttpConfiguration::default();
        let mut degraded = Vec::new();

        http.middlewares.insert(
            self.settings.loopback_middleware.clone(),
            Middleware {
                plugin: BTreeMap::from([(
                    self.settings.loopback_middleware.clone(),
                    serde_json::json!({}),
                )]),
            },
        );
        http.servers_transports.insert(
            self.settings.servers_transport.clone(),
            ServersTransport {
                disable_http2: self.settings.disable_http2,
            },
        );

        for group in self.registry.groups() {
            self.add_loopback(&mut http, group);

            let threshold = heights.get(&group.name);
            let fresh = |p: &Provider| latest.get(p.index).copied().flatten() >= threshold;

            match group.association {
                Association::Uniform if group.methods.is_empty() => {
                    let candidates: Vec<&Provider> = self.registry.group_providers(group).collect();
                    let selection = select(&candidates, fresh);
                    let name = group.name.clone();
                    if selection.degraded {
                        warn_degraded(&group.name, None);
                        degraded.push(name.clone());
                    }
                    self.add_pool(
                        &mut http,
                        name,
                        format!("PathPrefix(`/{}/`)", group.name),
                        selection.servers,
                    );
                }
                Association::Uniform => {
                    // Every method of a uniform group shares one of two pools.
                    let all: Vec<&Provider> = self.registry.group_providers(group).collect();
                    let mut shared: [Option<Selection>; 2] = [None, None];

                    for method in &group.methods {
                        let slot = usize::from(method.archive);
                        if shared[slot].is_none() {
                            let candidates = archive_filter(&group.name, method, all.clone());
                            let selection = select(&candidates, fresh);
                            if selection.degraded {
                                warn_degraded(&group.name, Some(&method.name));
                            }
                            shared[slot] = Some(selection);
                        }
                        if let Some(selection) = &shared[slot] {
                            let name = method_pool_name(&group.name, &method.name);
                            if selection.degraded {
                                degraded.push(name.clone());
                            }
                            let servers = selection.servers.clone();
                            self.add_method_pool(&mut http, group, method, name, servers);
                        }
                    }
                }
                Association::PerMethod => {
                    for method in &group.methods {
                        let serving: Vec<&Provider> = self
                            .registry
                            .group_providers(group)
                            .filter(|p| p.serves(&method.name))
                            .collect();
                        let candidates = archive_filter(&group.name, method, serving);
                        let selection = select(&candidates, fresh);
                        let name = method_pool_name(&group.name, &method.name);
                        if selection.degraded {
                            warn_degraded(&group.name, Some(&method.name));
                            degraded.push(name.clone());
                        }
                        self.add_method_pool(&mut http, group, method, name, selection.servers);
                    }
                }
            }

            debug!(
                "Generated routes for service '{}' at height {:?}",
                group.name, threshold
            );
        }

        Generation {
            configuration: RoutingConfiguration { http },
            degraded,
        }
    }

    fn add_loopback(&self, http: &mut HttpConfiguration, group: &Group) {
        let name = format!("{}loopback", group.name);
        http.routers.insert(
            name.clone(),
            Route {
                entry_points: vec![self.settings.entry_point.clone()],
                service: name.clone(),
                rule: format!("Path(`/{}`)", group.name),
                priority: LOOPBACK_PRIORITY,
                middlewares: vec![self.settings.loopback_middleware.clone()],
            },
        );
        http.services.insert(
            name,
            BackendPool {
                load_balancer: LoadBalancer {
                    strategy: Strategy::RoundRobin,
                    servers: vec![Server {
                        url: self.settings.loopback_url.clone(),
                    }],
                    pass_host_header: true,
                    servers_transport: self.settings.servers_transport.clone(),
                },
            },
        );
    }

    fn add_method_pool(
        &self,
        http: &mut HttpConfiguration,
        group: &Group,
        method: &Method,
        name: String,
        servers: Vec<Server>,
    ) {
        let rule = format!("PathPrefix(`{}`)", method_path(&group.name, &method.name));
        self.add_pool(http, name, rule, servers);
    }

    fn add_pool(
        &self,
        http: &mut HttpConfiguration,
        name: String,
        rule: String,
        servers: Vec<Server>,
    ) {
        http.routers.insert(
            name.clone(),
            Route {
                entry_points: vec![self.settings.entry_point.clone()],
                service: name.clone(),
                rule,
                priority: METHOD_PRIORITY,
                middlewares: Vec::new(),
            },
        );
        http.services.insert(
            name,
            BackendPool {
                load_balancer: LoadBalancer {
                    strategy: Strategy::RoundRobin,
                    servers,
                    pass_host_header: false,
                    servers_transport: self.settings.servers_transport.clone(),
                },
            },
        );
    }
}

/// `eth_getBlockByNumber` in group `eth` becomes `/eth/eth/getBlockByNumber`.
pub fn method_path(group: &str, method: &str) -> String {
    format!("/{}/{}", group, method.replace('_', "/"))
}

pub fn method_pool_name(group: &str, method: &str) -> String {
    format!("{}-{}", group, method)
}

fn archive_filter<'a>(
    group: &str,
    method: &Method,
    candidates: Vec<&'a Provider>,
) -> Vec<&'a Provider> {
    if !method.archive {
        return candidates;
    }
    let archive: Vec<&Provider> = candidates.iter().copied().filter(|p| p.archive).collect();
    if archive.is_empty() {
        warn!(
            "Service '{}' has no archive providers for '{}'. Using non-archive providers.",
            group, method.name
        );
        candidates
    } else {
        archive
    }
}

fn select<F>(candidates: &[&Provider], fresh: F) -> Selection
where
    F: Fn(&Provider) -> bool,
{
    let servers: Vec<Server> = candidates
        .iter()
        .filter(|&&p| fresh(p))
        .map(|p| Server { url: p.url.clone() })
        .collect();

    if servers.is_empty() && !candidates.is_empty() {
        return Selection {
            servers: candidates.iter().map(|p| Server { url: p.url.clone() }).collect(),
            degraded: true,
        };
    }

    Selection {
        servers,
        degraded: false,
    }
}

fn warn_degraded(group: &str, method: Option<&str>) {
    match method {
        Some(method) => warn!(
            "Service '{}' has no healthy providers for '{}'. Balancing across all.",
            group, method
        ),
        None => warn!(
            "Service '{}' has no healthy providers. Balancing across all.",
            group
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::registry::tests::{method, provider, uniform};

    fn eth_registry(urls: &[&str], methods: &[&str]) -> Arc<Registry> {
        let mut services = BTreeMap::new();
        services.insert(
            "eth".to_string(),
            uniform(
                urls.iter().map(|u| provider(u)).collect(),
                methods.iter().map(|m| method(m)).collect(),
            ),
        );
        Arc::new(Registry::load(&services).unwrap())
    }

    fn heights(group: &str, value: u64) -> HeightState {
        let mut state = HeightState::default();
        state.report(group, value);
        state
    }

    #[test]
    fn test_stale_provider_is_excluded() {
        let registry = eth_registry(
            &["http://a:8545", "http://b:8545", "http://c:8545"],
            &["eth_blockNumber", "eth_getBalance"],
        );
        let generator = Generator::new(registry, RoutingConfig::default());

        let latest = [Some(100), Some(100), Some(50)];
        let generation = generator.generate(&latest, &heights("eth", 100));
        let services = &generation.configuration.http.services;

        for name in ["eth-eth_blockNumber", "eth-eth_getBalance"] {
            let servers: Vec<&str> = services[name].servers().collect();
            assert_eq!(servers, vec!["http://a:8545", "http://b:8545"]);
        }
        assert!(generation.degraded.is_empty());
    }

    #[test]
    fn test_height_equal_to_threshold_is_eligible() {
        let registry = eth_registry(&["http://a:8545", "http://b:8545"], &["eth_call"]);
        let generator = Generator::new(registry, RoutingConfig::default());

        let generation = generator.generate(&[Some(150), Some(149)], &heights("eth", 150));
        let servers: Vec<&str> = generation.configuration.http.services["eth-eth_call"]
            .servers()
            .collect();
        assert_eq!(servers, vec!["http://a:8545"]);
    }

    #[test]
    fn test_fallback_uses_every_provider() {
        let registry = eth_registry(&["http://a:8545", "http://b:8545"], &["eth_call"]);
        let generator = Generator::new(registry, RoutingConfig::default());

        let generation = generator.generate(&[Some(10), None], &heights("eth", 20));
        let servers: Vec<&str> = generation.configuration.http.services["eth-eth_call"]
            .servers()
            .collect();
        assert_eq!(servers, vec!["http://a:8545", "http://b:8545"]);
        assert_eq!(generation.degraded, vec!["eth-eth_call".to_string()]);
    }

    #[test]
    fn test_unreported_group_routes_to_everyone() {
        let registry = eth_registry(&["http://a:8545", "http://b:8545"], &["eth_call"]);
        let generator = Generator::new(registry, RoutingConfig::default());

        let generation = generator.generate(&[None, None], &HeightState::default());
        assert_eq!(
            generation.configuration.http.services["eth-eth_call"].servers().count(),
            2
        );
        assert!(generation.degraded.is_empty());
    }

    #[test]
    fn test_routes_and_loopback_layout() {
        let registry = eth_registry(&["http://a:8545"], &["eth_getBlockByNumber"]);
        let generator = Generator::new(registry, RoutingConfig::default());

        let http = generator.generate(&[Some(1)], &heights("eth", 1)).configuration.http;

        let loopback = &http.routers["ethloopback"];
        assert_eq!(loopback.rule, "Path(`/eth`)");
        assert_eq!(loopback.priority, LOOPBACK_PRIORITY);
        assert_eq!(loopback.middlewares, vec!["rpcloopback".to_string()]);
        assert_eq!(loopback.entry_points, vec!["web".to_string()]);
        let loopback_pool = &http.services["ethloopback"].load_balancer;
        assert!(loopback_pool.pass_host_header);
        assert_eq!(loopback_pool.servers[0].url, "http://localhost:8000");

        let route = &http.routers["eth-eth_getBlockByNumber"];
        assert_eq!(route.rule, "PathPrefix(`/eth/eth/getBlockByNumber`)");
        assert_eq!(route.priority, METHOD_PRIORITY);
        assert_eq!(route.service, "eth-eth_getBlockByNumber");
        assert!(!http.services["eth-eth_getBlockByNumber"].load_balancer.pass_host_header);

        assert!(http.middlewares.contains_key("rpcloopback"));
        assert!(http.servers_transports["default"].disable_http2);
        assert_eq!(http.routers.len(), 2);
        assert_eq!(http.services.len(), 2);
    }

    #[test]
    fn test_uniform_group_without_methods_gets_one_pool() {
        let registry = eth_registry(&["http://a:8545", "http://b:8545"], &[]);
        let generator = Generator::new(registry, RoutingConfig::default());

        let http = generator.generate(&[Some(5), Some(3)], &heights("eth", 5)).configuration.http;
        assert_eq!(http.routers["eth"].rule, "PathPrefix(`/eth/`)");
        assert_eq!(http.services["eth"].servers().collect::<Vec<_>>(), vec!["http://a:8545"]);
    }

    #[test]
    fn test_per_method_and_archive_filters() {
        let mut full = provider("http://full:8545");
        full.methods = Some(vec!["eth_call".to_string()]);
        let mut archive = provider("http://archive:8545");
        archive.archive = true;
        archive.methods = Some(vec!["eth_call".to_string(), "debug_traceBlock".to_string()]);
        let mut trace = method("debug_traceBlock");
        trace.archive = true;

        let mut services = BTreeMap::new();
        services.insert(
            "eth".to_string(),
            ServiceConfig {
                association: Association::PerMethod,
                providers: vec![full, archive],
                methods: vec![method("eth_call"), trace],
            },
        );
        let registry = Arc::new(Registry::load(&services).unwrap());
        let generator = Generator::new(registry, RoutingConfig::default());

        // The archive node is behind, so debug_traceBlock degrades to its own list.
        let generation = generator.generate(&[Some(10), Some(9)], &heights("eth", 10));
        let services = &generation.configuration.http.services;

        assert_eq!(
            services["eth-eth_call"].servers().collect::<Vec<_>>(),
            vec!["http://full:8545"]
        );
        assert_eq!(
            services["eth-debug_traceBlock"].servers().collect::<Vec<_>>(),
            vec!["http://archive:8545"]
        );
        assert_eq!(generation.degraded, vec!["eth-debug_traceBlock".to_string()]);
    }

    #[test]
    fn test_generation_is_deterministic() {
        let mut services = BTreeMap::new();
        for group in ["eth", "arbitrum", "polygon"] {
            services.insert(
                group.to_string(),
                uniform(
                    vec![provider("http://a:8545"), provider("http://b:8545")],
                    vec![method("eth_call"), method("net_version"), method("eth_chainId")],
                ),
            );
        }
        let registry = Arc::new(Registry::load(&services).unwrap());
        let generator = Generator::new(registry, RoutingConfig::default());
        let latest = [Some(1), Some(2), Some(3), Some(3), None, Some(7)];
        let state = heights("polygon", 7);

        let first = generator.generate(&latest, &state).configuration;
        let second = generator.generate(&latest, &state).configuration;
        let first = serde_json::to_vec(&first).unwrap();
        let second = serde_json::to_vec(&second).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_serialized_shape() {
        let registry = eth_registry(&["http://a:8545"], &["eth_call"]);
        let generator = Generator::new(registry, RoutingConfig::default());
        let value = serde_json::to_value(
            generator.generate(&[None], &HeightState::default()).configuration,
        )
        .unwrap();

        assert_eq!(
            value["http"]["services"]["eth-eth_call"]["loadBalancer"]["servers"][0]["url"],
            "http://a:8545"
        );
        assert_eq!(
            value["http"]["services"]["eth-eth_call"]["loadBalancer"]["strategy"],
            "wrr"
        );
        assert_eq!(value["http"]["serversTransports"]["default"]["disableHTTP2"], true);
        assert_eq!(
            value["http"]["middlewares"]["rpcloopback"]["plugin"]["rpcloopback"],
            serde_json::json!({})
        );
        assert_eq!(value["http"]["routers"]["ethloopback"]["entryPoints"][0], "web");
    }
}
