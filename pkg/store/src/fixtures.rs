//! Object builders shared by the store tests.

use std::collections::BTreeMap;

use chrono::Utc;

use pkg_constants::annotations::key;
use pkg_types::endpoint::{Endpoint, EndpointAddress, EndpointPort};
use pkg_types::ingress::{
    Ingress, IngressBackend, IngressHTTP, IngressPath, IngressRule, IngressSpec, IngressTLS,
    PathType,
};
use pkg_types::service::{Service, ServicePort, ServiceSpec, ServiceType};

use crate::derive::DeriveOptions;

pub const OPTIONS: DeriveOptions = DeriveOptions {
    http_port: 80,
    https_port: 443,
};

pub fn ingress(name: &str, host: &str, path: &str, service: &str, port: u16) -> Ingress {
    Ingress {
        id: format!("{}-id", name),
        name: name.to_string(),
        namespace: "default".to_string(),
        annotations: BTreeMap::new(),
        spec: IngressSpec {
            rules: vec![IngressRule {
                host: host.to_string(),
                http: IngressHTTP {
                    paths: vec![IngressPath {
                        path: path.to_string(),
                        path_type: PathType::Prefix,
                        backend: IngressBackend {
                            service_name: service.to_string(),
                            service_port: port,
                        },
                    }],
                },
            }],
            tls: None,
            default_backend: None,
        },
        created_at: Utc::now(),
    }
}

pub fn l4_ingress(name: &str, host: &str, l4_port: &str, service: &str, port: u16) -> Ingress {
    let mut annotations = BTreeMap::new();
    annotations.insert(key("l4-enable"), "true".to_string());
    annotations.insert(key("l4-host"), host.to_string());
    annotations.insert(key("l4-port"), l4_port.to_string());
    Ingress {
        id: format!("{}-id", name),
        name: name.to_string(),
        namespace: "default".to_string(),
        annotations,
        spec: IngressSpec {
            rules: Vec::new(),
            tls: None,
            default_backend: Some(IngressBackend {
                service_name: service.to_string(),
                service_port: port,
            }),
        },
        created_at: Utc::now(),
    }
}

pub fn with_annotation(mut ingress: Ingress, name: &str, value: &str) -> Ingress {
    ingress.annotations.insert(key(name), value.to_string());
    ingress
}

pub fn with_tls(mut ingress: Ingress, host: &str, secret: &str) -> Ingress {
    ingress.spec.tls = Some(vec![IngressTLS {
        hosts: vec![host.to_string()],
        secret_name: secret.to_string(),
    }]);
    ingress
}

pub fn service(name: &str, port: u16, protocol: &str) -> Service {
    Service {
        id: format!("{}-id", name),
        name: name.to_string(),
        namespace: "default".to_string(),
        spec: ServiceSpec {
            selector: Default::default(),
            ports: vec![ServicePort {
                name: String::new(),
                port,
                target_port: port,
                node_port: None,
                protocol: protocol.to_string(),
            }],
            service_type: ServiceType::ClusterIP,
        },
        cluster_ip: None,
        created_at: Utc::now(),
    }
}

pub fn endpoints(service: &str, port: u16, ready: &[&str], not_ready: &[&str]) -> Endpoint {
    let addr = |ip: &&str| EndpointAddress {
        ip: ip.to_string(),
        node_id: None,
        pod_id: None,
    };
    Endpoint {
        id: format!("{}-ep", service),
        service_id: format!("{}-id", service),
        service_name: service.to_string(),
        namespace: "default".to_string(),
        addresses: ready.iter().map(addr).collect(),
        not_ready_addresses: not_ready.iter().map(addr).collect(),
        ports: vec![EndpointPort {
            name: String::new(),
            port,
            protocol: "TCP".to_string(),
        }],
        created_at: Utc::now(),
    }
}
