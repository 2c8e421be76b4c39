//! Control-plane adapter: the contract by which an external service watcher
//! installs and removes routes.
//!
//! The watcher itself (cluster client, polling loop, whatever drives it) is
//! an external collaborator; it submits [`RoutingEvent`]s over an ordered
//! channel and this module applies them to the route table.

use std::{collections::BTreeMap, sync::Arc};

use tokio::sync::{mpsc, watch};

use crate::lodestone::routes::RouteTable;

/// Annotation carrying a comma-separated list of routable hostnames.
pub const ANNOTATION_EXTERNAL_SERVER_NAME: &str = "externalServerName";
/// Annotation marking a service as the default route (presence is enough).
pub const ANNOTATION_DEFAULT_SERVER: &str = "defaultServer";
/// Named service port that overrides the Minecraft default.
pub const ROUTER_PORT_NAME: &str = "mc-router";

pub const DEFAULT_MINECRAFT_PORT: u16 = 25565;

/// One routable target extracted from a service record. A `None` host means
/// the service is the default route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutableService {
    pub host: Option<String>,
    pub endpoint: String,
}

#[derive(Debug, Clone)]
pub enum RoutingEvent {
    Added(Vec<RoutableService>),
    Removed(Vec<RoutableService>),
    Modified {
        old: Vec<RoutableService>,
        new: Vec<RoutableService>,
    },
}

/// Applies one event to the table.
///
/// A modification is delete-of-old-keys then create-of-new-keys. The gap is
/// not atomic; control-plane events are rare and spliced connections never
/// consult the table again.
pub fn apply_event(table: &RouteTable, event: RoutingEvent) {
    match event {
        RoutingEvent::Added(services) => install(table, &services),
        RoutingEvent::Removed(services) => uninstall(table, &services, true),
        RoutingEvent::Modified { old, new } => {
            uninstall(table, &old, false);
            install(table, &new);
        }
    }
}

fn install(table: &RouteTable, services: &[RoutableService]) {
    for svc in services {
        match &svc.host {
            Some(host) => {
                tracing::debug!(host = %host, endpoint = %svc.endpoint, "control: mapping added");
                table.create_mapping(host, &svc.endpoint);
            }
            None => {
                tracing::debug!(endpoint = %svc.endpoint, "control: default route set");
                table.set_default_route(&svc.endpoint);
            }
        }
    }
}

fn uninstall(table: &RouteTable, services: &[RoutableService], clear_default: bool) {
    for svc in services {
        match &svc.host {
            Some(host) => {
                tracing::debug!(host = %host, "control: mapping removed");
                table.delete_mapping(host);
            }
            None if clear_default => {
                tracing::debug!("control: default route cleared");
                table.set_default_route("");
            }
            None => {}
        }
    }
}

/// Consumes watcher events in submission order until the channel closes or
/// shutdown is signalled. Readers observe every mutation in the order it was
/// submitted.
pub async fn run_route_feed(
    table: Arc<RouteTable>,
    mut events: mpsc::Receiver<RoutingEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                apply_event(&table, event);
            }
        }
    }
}

/// One exposed port of a service record.
#[derive(Debug, Clone)]
pub struct ServicePort {
    pub name: String,
    pub port: u16,
}

/// Extracts the routable targets a service record advertises.
///
/// `externalServerName` yields one target per comma-separated host; a
/// `defaultServer` annotation with no host list yields a single default
/// target. Annotation keys match on their final path segment, so prefixed
/// forms (`some.domain/externalServerName`) work too. The endpoint port is
/// the `mc-router` named port when present, 25565 otherwise.
pub fn routable_services(
    annotations: &BTreeMap<String, String>,
    service_ip: &str,
    ports: &[ServicePort],
) -> Vec<RoutableService> {
    let endpoint = format!("{}:{}", service_ip, endpoint_port(ports));

    if let Some(hosts) = annotation(annotations, ANNOTATION_EXTERNAL_SERVER_NAME) {
        return hosts
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(|host| RoutableService {
                host: Some(host.to_string()),
                endpoint: endpoint.clone(),
            })
            .collect();
    }

    if annotation(annotations, ANNOTATION_DEFAULT_SERVER).is_some() {
        return vec![RoutableService {
            host: None,
            endpoint,
        }];
    }

    Vec::new()
}

fn endpoint_port(ports: &[ServicePort]) -> u16 {
    ports
        .iter()
        .find(|p| p.name == ROUTER_PORT_NAME)
        .map(|p| p.port)
        .unwrap_or(DEFAULT_MINECRAFT_PORT)
}

fn annotation<'a>(annotations: &'a BTreeMap<String, String>, name: &str) -> Option<&'a str> {
    annotations
        .iter()
        .find(|(key, _)| key.rsplit('/').next() == Some(name))
        .map(|(_, value)| value.as_str())
}
