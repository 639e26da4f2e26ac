//! Derivation of virtual services and pools from the cached cluster objects.
//!
//! Everything here is a pure function of its input so that one store read
//! always yields the same [`Snapshot`].

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::{debug, warn};

use pkg_annotations::{IngressAnnotations, ProxyConfig, RewriteConfig};
use pkg_constants::network::ANY_HOST;
use pkg_types::endpoint::Endpoint;
use pkg_types::ingress::{Ingress, IngressBackend, PathType};
use pkg_types::object_key;
use pkg_types::service::{Service, ServicePort};

use crate::model::{
    Condition, ConditionKind, HttpRule, Location, Node, Pool, Protocol, Snapshot, SslCert,
    TcpRule, VirtualService, http_pool_name, l4_pool_name,
};

/// Listener ports rendered into HTTP(S) virtual services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeriveOptions {
    pub http_port: u16,
    pub https_port: u16,
}

/// Consistent view of the caches taken for one derivation.
pub struct DeriveInput<'a> {
    /// Sorted by ingress key.
    pub ingresses: &'a [(Ingress, IngressAnnotations)],
    pub services: &'a HashMap<String, Service>,
    pub endpoints: &'a HashMap<String, Endpoint>,
    /// Secret key → parsed certificate, valid secrets only.
    pub certs: &'a HashMap<String, SslCert>,
    pub local_ips: &'a BTreeSet<String>,
    pub options: DeriveOptions,
}

/// Per-pool attributes taken from the first ingress referencing it.
struct PoolSpec {
    namespace: String,
    service: String,
    port: ServicePort,
    weight: u32,
    annotations: IngressAnnotations,
}

#[derive(Default)]
struct HostBuilder {
    namespace: String,
    secret: Option<String>,
    locations: BTreeMap<(String, bool), LocationBuilder>,
}

struct LocationBuilder {
    name_condition: BTreeMap<String, Condition>,
    default_owner: Option<(String, String)>,
    rewrite: Option<RewriteConfig>,
    proxy: ProxyConfig,
}

fn resolve_backend<'a>(
    services: &'a HashMap<String, Service>,
    namespace: &str,
    backend: &IngressBackend,
) -> Option<(&'a Service, &'a ServicePort)> {
    let service = services.get(&object_key(namespace, &backend.service_name))?;
    let port = service.port(backend.service_port)?;
    Some((service, port))
}

/// Project an ingress's HTTP rules. Rules whose backend is unknown are skipped.
pub fn http_rules(
    ingress: &Ingress,
    annotations: &IngressAnnotations,
    services: &HashMap<String, Service>,
) -> Vec<HttpRule> {
    let condition = if let Some(values) = &annotations.header {
        Condition::header(values.clone())
    } else if let Some(values) = &annotations.cookie {
        Condition::cookie(values.clone())
    } else {
        Condition::default_route()
    };

    let mut paths: Vec<(String, String, bool, &IngressBackend)> = Vec::new();
    for rule in &ingress.spec.rules {
        for path in &rule.http.paths {
            let p = if path.path.is_empty() { "/".to_string() } else { path.path.clone() };
            paths.push((rule.host.clone(), p, path.path_type == PathType::Exact, &path.backend));
        }
    }
    if paths.is_empty() {
        if let Some(backend) = &ingress.spec.default_backend {
            paths.push((String::new(), "/".to_string(), false, backend));
        }
    }

    let mut rules = Vec::new();
    for (host, path, exact, backend) in paths {
        let Some((service, port)) = resolve_backend(services, &ingress.namespace, backend) else {
            debug!(
                ingress = %ingress.key(),
                "Backend {}:{} not found, skipping rule",
                backend.service_name,
                backend.service_port
            );
            continue;
        };
        let tls_secret = ingress
            .spec
            .tls
            .iter()
            .flatten()
            .find(|t| t.hosts.is_empty() || t.hosts.iter().any(|h| h == &host))
            .filter(|t| !t.secret_name.is_empty())
            .map(|t| object_key(&ingress.namespace, &t.secret_name));
        rules.push(HttpRule {
            ingress: ingress.key(),
            namespace: ingress.namespace.clone(),
            host,
            path,
            exact,
            service: service.name.clone(),
            service_port: port.port,
            pool: http_pool_name(&ingress.namespace, &service.name, port.port),
            condition: condition.clone(),
            tls_secret,
        });
    }
    rules
}

/// Project an L4-enabled ingress onto its exposed backend.
pub fn tcp_rule(
    ingress: &Ingress,
    annotations: &IngressAnnotations,
    services: &HashMap<String, Service>,
) -> Option<TcpRule> {
    let l4 = annotations.l4.as_ref()?;
    let backend = ingress.spec.default_backend.as_ref().or_else(|| {
        ingress
            .spec
            .rules
            .iter()
            .flat_map(|r| r.http.paths.iter())
            .map(|p| &p.backend)
            .next()
    })?;
    let Some((service, port)) = resolve_backend(services, &ingress.namespace, backend) else {
        debug!(
            ingress = %ingress.key(),
            "L4 backend {}:{} not found",
            backend.service_name,
            backend.service_port
        );
        return None;
    };
    let protocol = if port.protocol.eq_ignore_ascii_case("UDP") {
        Protocol::Udp
    } else {
        Protocol::Tcp
    };
    Some(TcpRule {
        ingress: ingress.key(),
        namespace: ingress.namespace.clone(),
        host: l4.host.clone(),
        port: l4.port,
        protocol,
        service: service.name.clone(),
        service_port: port.port,
        pool: l4_pool_name(&ingress.namespace, &service.name, port.port, protocol),
    })
}

/// Endpoint port matching a service port: by name, then target port, then
/// the only port, then the target port itself.
fn endpoint_port(endpoint: &Endpoint, port: &ServicePort) -> u16 {
    if !port.name.is_empty() {
        if let Some(p) = endpoint.ports.iter().find(|p| p.name == port.name) {
            return p.port;
        }
    }
    if let Some(p) = endpoint.ports.iter().find(|p| p.port == port.target_port) {
        return p.port;
    }
    if let [only] = endpoint.ports.as_slice() {
        return only.port;
    }
    port.target_port
}

fn build_pool(name: &str, spec: &PoolSpec, endpoints: &HashMap<String, Endpoint>) -> Pool {
    let mut nodes = Vec::new();
    if let Some(endpoint) = endpoints.get(&object_key(&spec.namespace, &spec.service)) {
        let port = endpoint_port(endpoint, &spec.port);
        let ready = endpoint.addresses.iter().map(|a| (a, true));
        let not_ready = endpoint.not_ready_addresses.iter().map(|a| (a, false));
        for (addr, is_ready) in ready.chain(not_ready) {
            nodes.push(Node {
                host: addr.ip.clone(),
                port,
                weight: spec.weight,
                ready: is_ready,
                max_fails: spec.annotations.proxy.max_fails,
                fail_timeout: spec.annotations.proxy.fail_timeout,
            });
        }
    }
    nodes.sort_by(|a, b| (&a.host, a.port).cmp(&(&b.host, b.port)));
    // An address listed both ready and not ready keeps the ready entry.
    nodes.dedup_by(|b, a| a.host == b.host && a.port == b.port);

    Pool {
        name: name.to_string(),
        namespace: spec.namespace.clone(),
        service: spec.service.clone(),
        port: spec.port.port,
        lb: spec.annotations.lb_type,
        hash_by: spec.annotations.upstream_hash_by.clone(),
        nodes,
    }
}

fn register_pool(
    pools: &mut BTreeMap<String, PoolSpec>,
    name: &str,
    ingress: &Ingress,
    annotations: &IngressAnnotations,
    service: &str,
    service_port: u16,
    services: &HashMap<String, Service>,
) {
    if pools.contains_key(name) {
        return;
    }
    let backend = IngressBackend {
        service_name: service.to_string(),
        service_port,
    };
    if let Some((service, port)) = resolve_backend(services, &ingress.namespace, &backend) {
        pools.insert(
            name.to_string(),
            PoolSpec {
                namespace: ingress.namespace.clone(),
                service: service.name.clone(),
                port: port.clone(),
                weight: annotations.weight,
                annotations: annotations.clone(),
            },
        );
    }
}

/// Derive a snapshot. Outputs are sorted so that equal inputs produce
/// equal snapshots.
pub fn derive(input: &DeriveInput<'_>) -> Snapshot {
    let mut hosts: BTreeMap<String, HostBuilder> = BTreeMap::new();
    let mut http_pools: BTreeMap<String, PoolSpec> = BTreeMap::new();
    let mut tcp_pools: BTreeMap<String, PoolSpec> = BTreeMap::new();
    let mut l4_claims: BTreeMap<(String, u16), (String, TcpRule)> = BTreeMap::new();

    for (ingress, annotations) in input.ingresses {
        if annotations.l4.is_some() {
            let Some(rule) = tcp_rule(ingress, annotations, input.services) else {
                continue;
            };
            if rule.host != ANY_HOST && !input.local_ips.contains(&rule.host) {
                debug!(ingress = %rule.ingress, "L4 host {} is not local, skipping", rule.host);
                continue;
            }
            let claim = (rule.host.clone(), rule.port);
            if let Some((owner, _)) = l4_claims.get(&claim) {
                warn!(
                    ingress = %rule.ingress,
                    "L4 endpoint {}:{} already claimed by {}, dropping rule",
                    rule.host,
                    rule.port,
                    owner
                );
                continue;
            }
            register_pool(
                &mut tcp_pools,
                &rule.pool,
                ingress,
                annotations,
                &rule.service,
                rule.service_port,
                input.services,
            );
            l4_claims.insert(claim, (rule.ingress.clone(), rule));
            continue;
        }

        if let Some(reason) = &annotations.denied {
            warn!(ingress = %ingress.key(), "Locations denied: {}", reason);
            continue;
        }

        for rule in http_rules(ingress, annotations, input.services) {
            let server_name = if rule.host.is_empty() { "_".to_string() } else { rule.host.clone() };
            let host = hosts.entry(server_name).or_insert_with(|| HostBuilder {
                namespace: rule.namespace.clone(),
                ..Default::default()
            });
            if host.secret.is_none() {
                host.secret = rule.tls_secret.clone();
            }

            let location = host
                .locations
                .entry((rule.path.clone(), rule.exact))
                .or_insert_with(|| LocationBuilder {
                    name_condition: BTreeMap::new(),
                    default_owner: None,
                    rewrite: annotations.rewrite.clone(),
                    proxy: annotations.proxy.clone(),
                });

            if rule.condition.kind == ConditionKind::Default {
                match &location.default_owner {
                    Some((owner, pool)) if pool != &rule.pool => {
                        warn!(
                            ingress = %rule.ingress,
                            "Location {} already has default backend {} from {}, dropping",
                            rule.path,
                            pool,
                            owner
                        );
                        continue;
                    }
                    Some(_) => {}
                    None => {
                        // The default backend's ingress owns the location attributes.
                        location.rewrite = annotations.rewrite.clone();
                        location.proxy = annotations.proxy.clone();
                        location.default_owner = Some((rule.ingress.clone(), rule.pool.clone()));
                    }
                }
            }

            if location.name_condition.contains_key(&rule.pool) {
                debug!(ingress = %rule.ingress, "Pool {} already routed on {}", rule.pool, rule.path);
            } else {
                location
                    .name_condition
                    .insert(rule.pool.clone(), rule.condition.clone());
            }

            register_pool(
                &mut http_pools,
                &rule.pool,
                ingress,
                annotations,
                &rule.service,
                rule.service_port,
                input.services,
            );
        }
    }

    let mut l7_services = Vec::new();
    for (server_name, host) in hosts {
        let ssl = match &host.secret {
            Some(secret) => match input.certs.get(secret) {
                Some(cert) => Some(cert.clone()),
                None => {
                    warn!(
                        host = %server_name,
                        "TLS secret {} missing or invalid, serving plain HTTP",
                        secret
                    );
                    None
                }
            },
            None => None,
        };
        let (protocol, listening) = match ssl {
            Some(_) => (Protocol::Https, format!(":{} ssl", input.options.https_port)),
            None => (Protocol::Http, format!(":{}", input.options.http_port)),
        };

        let locations: Vec<Location> = host
            .locations
            .into_iter()
            .map(|((path, exact), l)| Location {
                path,
                exact,
                name_condition: l.name_condition,
                rewrite: l.rewrite,
                proxy: l.proxy,
            })
            .collect();
        let default_pool = locations
            .iter()
            .find(|l| l.path == "/")
            .or_else(|| locations.first())
            .and_then(|l| l.default_pool())
            .map(str::to_string);

        l7_services.push(VirtualService {
            name: server_name.clone(),
            namespace: host.namespace,
            protocol,
            listening: BTreeSet::from([listening]),
            server_name,
            ssl,
            locations,
            default_pool,
        });
    }

    let l4_services: Vec<VirtualService> = l4_claims
        .into_values()
        .map(|(_, rule)| {
            let endpoint = format!("{}:{}", rule.host, rule.port);
            VirtualService {
                name: endpoint.clone(),
                namespace: rule.namespace,
                protocol: rule.protocol,
                listening: BTreeSet::from([endpoint]),
                server_name: String::new(),
                ssl: None,
                locations: Vec::new(),
                default_pool: Some(rule.pool),
            }
        })
        .collect();

    Snapshot {
        http_pools: http_pools
            .iter()
            .map(|(name, spec)| build_pool(name, spec, input.endpoints))
            .collect(),
        tcp_pools: tcp_pools
            .iter()
            .map(|(name, spec)| build_pool(name, spec, input.endpoints))
            .collect(),
        l7_services,
        l4_services,
    }
}
