//! UID/GID based security policy.
//!
//! A policy maps the credentials of an attached application to the id
//! ranges it may request and offer. Enforcement is off unless the
//! configuration sets `check_credentials`; `audit_mode` logs denials but
//! still permits the call. Policies can be replaced at runtime through the
//! `UPDATE_SECURITY_POLICY` / `REMOVE_SECURITY_POLICY` IPC commands.

use std::collections::HashMap;

/// Credentials of a locally attached application (`SO_PEERCRED`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

/// Inclusive id range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdRange {
    pub first: u16,
    pub last: u16,
}

impl IdRange {
    pub fn single(id: u16) -> Self {
        IdRange { first: id, last: id }
    }

    pub fn any() -> Self {
        IdRange {
            first: 0x0000,
            last: 0xFFFF,
        }
    }

    pub fn contains(&self, id: u16) -> bool {
        self.first <= id && id <= self.last
    }
}

/// One granted service: which instances and methods of a service id the
/// holder may touch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRight {
    pub service: u16,
    pub instances: Vec<IdRange>,
    pub methods: Vec<IdRange>,
}

impl ServiceRight {
    fn matches(&self, service: u16, instance: u16, method: Option<u16>) -> bool {
        if self.service != service {
            return false;
        }
        if !self.instances.iter().any(|r| r.contains(instance)) {
            return false;
        }
        match method {
            Some(m) => self.methods.iter().any(|r| r.contains(m)),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyRights {
    pub requests: Vec<ServiceRight>,
    pub offers: Vec<ServiceRight>,
}

/// Decision gate consulted for every local command.
#[derive(Debug, Default)]
pub struct PolicyManager {
    check_credentials: bool,
    audit_mode: bool,
    policies: HashMap<Credentials, PolicyRights>,
}

impl PolicyManager {
    pub fn new(check_credentials: bool, audit_mode: bool) -> Self {
        PolicyManager {
            check_credentials,
            audit_mode,
            policies: HashMap::new(),
        }
    }

    /// Installs or replaces the policy for `creds`, effective immediately.
    pub fn update(&mut self, creds: Credentials, rights: PolicyRights) {
        self.policies.insert(creds, rights);
    }

    pub fn remove(&mut self, creds: Credentials) {
        self.policies.remove(&creds);
    }

    pub fn is_request_allowed(
        &self,
        creds: Credentials,
        service: u16,
        instance: u16,
        method: u16,
    ) -> bool {
        self.decide(creds, |rights| {
            rights
                .requests
                .iter()
                .any(|r| r.matches(service, instance, Some(method)))
        })
    }

    /// Method-agnostic variant for REQUEST_SERVICE style commands.
    pub fn is_request_allowed_service(
        &self,
        creds: Credentials,
        service: u16,
        instance: u16,
    ) -> bool {
        self.decide(creds, |rights| {
            rights
                .requests
                .iter()
                .any(|r| r.matches(service, instance, None))
        })
    }

    pub fn is_offer_allowed(&self, creds: Credentials, service: u16, instance: u16) -> bool {
        self.decide(creds, |rights| {
            rights.offers.iter().any(|r| r.matches(service, instance, None))
        })
    }

    fn decide<F>(&self, creds: Credentials, check: F) -> bool
    where
        F: FnOnce(&PolicyRights) -> bool,
    {
        if !self.check_credentials {
            return true;
        }

        let allowed = match self.policies.get(&creds) {
            Some(rights) => check(rights),
            // absence of a policy denies once enforcement is on
            None => false,
        };

        if !allowed {
            if self.audit_mode {
                log::warn!(
                    "audit: denied uid {} gid {} (permitted by audit mode)",
                    creds.uid,
                    creds.gid
                );
                return true;
            }
            log::warn!("policy: denied uid {} gid {}", creds.uid, creds.gid);
        }
        allowed
    }
}
