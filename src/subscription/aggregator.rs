//! Collects every descriptor a customer can connect with.

use std::cmp::Reverse;

use base64::Engine;
use futures_util::stream::{self, StreamExt};
use serde::Serialize;

use crate::backend::{BackendSelector, Placement};
use crate::config::BackendDescriptor;
use crate::descriptor;
use crate::executor::{Credential, Identity};
use crate::orchestrator::Orchestrator;

/// Traffic and quota figures reported to client software.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub upload: u64,
    pub download: u64,
    /// Quota in bytes, 0 for unlimited.
    pub total: u64,
    /// Expiry in unix seconds, 0 for never.
    pub expire: i64,
}

impl Usage {
    fn from_credential(credential: &Credential) -> Self {
        Self {
            upload: credential.upload,
            download: credential.download,
            total: credential.quota_bytes,
            expire: credential.expiry_ms.max(0) / 1000,
        }
    }

    /// Value of the `subscription-userinfo` header.
    pub fn header_value(&self) -> String {
        format!(
            "upload={}; download={}; total={}; expire={}",
            self.upload, self.download, self.total, self.expire
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Subscription {
    pub descriptors: Vec<String>,
    pub usage: Option<Usage>,
}

impl Subscription {
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Newline-joined descriptors, base64 encoded.
    pub fn encoded(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.descriptors.join("\n"))
    }
}

/// What one backend contributed.
struct BackendShare {
    descriptors: Vec<String>,
    primary: Option<(String, Credential)>,
}

/// Builds subscriptions over the enabled backends of an [`Orchestrator`].
pub struct Aggregator<'a> {
    orchestrator: &'a Orchestrator,
    home: Option<String>,
}

impl<'a> Aggregator<'a> {
    pub fn new(orchestrator: &'a Orchestrator) -> Self {
        Self {
            orchestrator,
            home: None,
        }
    }

    /// Backend whose usage figures win when several report the identity.
    pub fn with_home(mut self, home: Option<String>) -> Self {
        self.home = home;
        self
    }

    /// Subscription for a stored customer: its linked identities and home
    /// backend come from the customer store.
    pub async fn for_customer(self, identity: Identity) -> Subscription {
        let store = self.orchestrator.store();
        let linked = store.linked(identity);
        let home = self
            .home
            .clone()
            .or_else(|| store.by_identity(identity).and_then(|c| c.home_backend));
        self.with_home(home).build(identity, &linked).await
    }

    /// Descriptors for `primary` and `linked` on every enabled backend, in
    /// primary-first backend order. A backend that fails or lacks an
    /// identity contributes nothing.
    pub async fn build(&self, primary: Identity, linked: &[Identity]) -> Subscription {
        let mut identities = vec![primary];
        for identity in linked {
            if !identities.contains(identity) {
                identities.push(*identity);
            }
        }

        let backends = self
            .orchestrator
            .registry()
            .select(&BackendSelector::All, Placement::Existing);

        let lookups: Vec<_> = backends
            .iter()
            .map(|backend| self.collect(backend, primary, &identities))
            .collect();
        let shares: Vec<BackendShare> = stream::iter(lookups)
            .buffered(self.orchestrator.fanout_limit())
            .collect()
            .await;

        let mut descriptors = Vec::new();
        let mut reports = Vec::new();
        for share in shares {
            descriptors.extend(share.descriptors);
            reports.extend(share.primary);
        }

        let usage = self.pick_usage(&reports).map(Usage::from_credential);
        tracing::debug!(
            identity = %primary,
            linked = linked.len(),
            descriptors = descriptors.len(),
            "Subscription built"
        );
        Subscription { descriptors, usage }
    }

    async fn collect(
        &self,
        backend: &BackendDescriptor,
        primary: Identity,
        identities: &[Identity],
    ) -> BackendShare {
        let mut share = BackendShare {
            descriptors: Vec::new(),
            primary: None,
        };

        for identity in identities {
            match self.orchestrator.lookup_on(backend, *identity).await {
                Ok(Some((credential, profile))) => {
                    share.descriptors.push(descriptor::build(
                        credential.identity,
                        &credential.label,
                        backend,
                        &profile,
                    ));
                    if *identity == primary {
                        share.primary = Some((backend.name.clone(), credential));
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(backend = %backend.name, identity = %identity, error = %e, "Skipping backend in subscription");
                }
            }
        }
        share
    }

    /// The home backend's figures when it reports the identity, else the
    /// backend with the most traffic.
    fn pick_usage<'r>(&self, reports: &'r [(String, Credential)]) -> Option<&'r Credential> {
        if let Some(home) = &self.home {
            if let Some((_, credential)) = reports.iter().find(|(name, _)| name == home) {
                return Some(credential);
            }
        }
        reports
            .iter()
            .min_by_key(|(_, c)| Reverse(c.upload.saturating_add(c.download)))
            .map(|(_, credential)| credential)
    }
}
