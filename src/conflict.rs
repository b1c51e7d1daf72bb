//! Uniqueness checks for name, port and domain, run before anything on a
//! host is touched.

use crate::error::{AppError, Result};
use crate::registry::{Instance, Registry};
use crate::runner::{CommandRunner, Target};
use crate::service::list_units_with_prefix;
use crate::validation::{
    instance_id_from_service, slugify, validate_domain, validate_name, validate_port, SERVICE_PREFIX,
};

const SUGGESTION_ATTEMPTS: u32 = 1000;

pub struct ConflictGuard<'a> {
    registry: &'a Registry,
    check_local_ports: bool,
}

impl<'a> ConflictGuard<'a> {
    pub fn new(registry: &'a Registry) -> Self {
        Self {
            registry,
            check_local_ports: false,
        }
    }

    /// Also require suggested ports to be free on this machine.
    pub fn for_target(registry: &'a Registry, target: &Target) -> Self {
        Self {
            registry,
            check_local_ports: !target.is_remote(),
        }
    }

    /// Fail on the first colliding field (name, then port, then domain),
    /// ignoring the instance `exclude_id`.
    pub fn validate(&self, name: &str, port: u16, domain: &str, exclude_id: Option<&str>) -> Result<()> {
        validate_name(name)?;
        validate_port(port)?;
        validate_domain(domain)?;

        let instances: Vec<Instance> = self
            .registry
            .list()?
            .into_iter()
            .filter(|i| Some(i.id.as_str()) != exclude_id)
            .collect();

        match find_collision(&instances, name, port, domain) {
            Some(Collision::Name) => {
                let suggestion = suggest_name(&instances, name);
                Err(AppError::conflict("name", name, suggestion))
            }
            Some(Collision::Port) => {
                let suggestion = self.suggest_port(&instances, port).map(|p| p.to_string());
                Err(AppError::conflict("port", &port.to_string(), suggestion))
            }
            Some(Collision::Domain) => {
                let suggestion = suggest_domain(&instances, domain);
                Err(AppError::conflict("domain", domain, suggestion))
            }
            None => Ok(()),
        }
    }

    fn suggest_port(&self, instances: &[Instance], port: u16) -> Option<u16> {
        (1..=SUGGESTION_ATTEMPTS)
            .filter_map(|offset| port.checked_add(u16::try_from(offset).ok()?))
            .find(|candidate| {
                !instances.iter().any(|i| i.port == *candidate)
                    && (!self.check_local_ports || portpicker::is_free_tcp(*candidate))
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collision {
    Name,
    Port,
    Domain,
}

impl Collision {
    pub fn field(self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Port => "port",
            Self::Domain => "domain",
        }
    }

    /// The colliding value as it appears on `instance`.
    pub fn value_of(self, instance: &Instance) -> String {
        match self {
            Self::Name => instance.name.clone(),
            Self::Port => instance.port.to_string(),
            Self::Domain => instance.domain.clone(),
        }
    }
}

/// First field (name, then port, then domain) that `instances` already use.
pub fn find_collision(instances: &[Instance], name: &str, port: u16, domain: &str) -> Option<Collision> {
    if instances.iter().any(|i| name_taken(i, name)) {
        Some(Collision::Name)
    } else if instances.iter().any(|i| i.port == port) {
        Some(Collision::Port)
    } else if instances.iter().any(|i| i.domain.eq_ignore_ascii_case(domain.trim())) {
        Some(Collision::Domain)
    } else {
        None
    }
}

/// Names collide ignoring case, and also when they share a slug since the
/// slug names the install directory.
fn name_taken(instance: &Instance, name: &str) -> bool {
    instance.name.eq_ignore_ascii_case(name.trim()) || instance.slug() == slugify(name)
}

fn suggest_name(instances: &[Instance], name: &str) -> Option<String> {
    (2..=SUGGESTION_ATTEMPTS)
        .map(|n| format!("{}-{}", name.trim(), n))
        .find(|candidate| !instances.iter().any(|i| name_taken(i, candidate)))
}

fn suggest_domain(instances: &[Instance], domain: &str) -> Option<String> {
    let (label, rest) = domain.split_once('.')?;
    (2..=SUGGESTION_ATTEMPTS)
        .map(|n| format!("{}-{}.{}", label, n, rest))
        .find(|candidate| !instances.iter().any(|i| i.domain.eq_ignore_ascii_case(candidate)))
}

/// Service units on the host that follow our naming scheme but belong to no
/// registered instance on that target. Failures are logged and yield an
/// empty list.
pub async fn detect_orphans(runner: &dyn CommandRunner, registry: &Registry, target: &Target) -> Vec<String> {
    let units = match list_units_with_prefix(runner, SERVICE_PREFIX).await {
        Ok(units) => units,
        Err(e) => {
            log::warn!("Orphan detection skipped on {}: {}", target.label(), e);
            return Vec::new();
        }
    };
    let instances = match registry.list() {
        Ok(instances) => instances,
        Err(e) => {
            log::warn!("Orphan detection skipped, registry unavailable: {}", e);
            return Vec::new();
        }
    };

    let orphans: Vec<String> = units
        .into_iter()
        .filter(|unit| {
            let Some(id) = instance_id_from_service(unit) else {
                return false;
            };
            !instances.iter().any(|i| i.id == id && &i.target == target)
        })
        .collect();
    for unit in &orphans {
        log::warn!("Orphaned service {} on {} is not in the registry", unit, target.label());
    }
    orphans
}
