//! Optional off-record storage for credential attribute bags. When a
//! backend is configured the persisted credential record keeps an empty bag
//! and the material lives here.

use std::collections::BTreeMap;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::record::CredentialTag;
use crate::{Error, Result};

#[async_trait]
pub trait SecretsStore: Send + Sync {
    async fn put(&self, tag: &CredentialTag, attributes: BTreeMap<String, String>) -> Result<()>;
    async fn get(&self, tag: &CredentialTag) -> Result<BTreeMap<String, String>>;
    async fn delete(&self, tag: &CredentialTag) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemorySecrets {
    bags: DashMap<String, BTreeMap<String, String>>,
}

impl MemorySecrets {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretsStore for MemorySecrets {
    async fn put(&self, tag: &CredentialTag, attributes: BTreeMap<String, String>) -> Result<()> {
        self.bags.insert(tag.to_string(), attributes);
        Ok(())
    }

    async fn get(&self, tag: &CredentialTag) -> Result<BTreeMap<String, String>> {
        self.bags
            .get(&tag.to_string())
            .map(|bag| bag.clone())
            .ok_or_else(|| Error::not_found(format!("secret for credential {tag}")))
    }

    async fn delete(&self, tag: &CredentialTag) -> Result<()> {
        self.bags.remove(&tag.to_string());
        Ok(())
    }
}
