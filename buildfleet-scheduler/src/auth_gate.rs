// Copyright 2024 The NativeLink Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use buildfleet_error::{Error, ResultExt};
use buildfleet_util::collection_trait::DistributedMap;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tracing::{Level, event};

use crate::queue_coordinator::AgentRegistry;

/// Fingerprint of a public key: `SHA256:` followed by the lower case hex
/// SHA-256 digest of the encoded key.
pub fn public_key_fingerprint(public_key: &[u8]) -> String {
    format!("SHA256:{}", hex::encode(Sha256::digest(public_key)))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserIdentity {
    pub user_id: u64,
    pub login: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentIdentity {
    pub name: String,
    pub display_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthOutcome {
    User(UserIdentity),
    Agent(AgentIdentity),
    /// Deliberately carries no reason.
    Rejected,
}

/// Lookup of registered user keys.
#[async_trait]
pub trait UserIdentityStore: Send + Sync + 'static {
    async fn find_by_fingerprint(&self, fingerprint: &str) -> Result<Option<UserIdentity>, Error>;
}

/// `UserIdentityStore` over a fixed set of keys.
#[derive(Debug, Default)]
pub struct StaticUserIdentityStore {
    users: RwLock<HashMap<String, UserIdentity>>,
}

impl StaticUserIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_key(&self, public_key: &[u8], user: UserIdentity) {
        self.users
            .write()
            .insert(public_key_fingerprint(public_key), user);
    }
}

#[async_trait]
impl UserIdentityStore for StaticUserIdentityStore {
    async fn find_by_fingerprint(&self, fingerprint: &str) -> Result<Option<UserIdentity>, Error> {
        Ok(self.users.read().get(fingerprint).cloned())
    }
}

/// Decides who is presenting a public key. Users take precedence, so a key
/// shared by a user and an agent always authenticates as the user.
pub struct AuthenticationGate {
    users: Arc<dyn UserIdentityStore>,
    agents: AgentRegistry,
}

impl core::fmt::Debug for AuthenticationGate {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AuthenticationGate").finish_non_exhaustive()
    }
}

impl AuthenticationGate {
    pub fn new(users: Arc<dyn UserIdentityStore>, agents: AgentRegistry) -> Self {
        Self { users, agents }
    }

    pub async fn authenticate(&self, public_key: &[u8]) -> AuthOutcome {
        let fingerprint = public_key_fingerprint(public_key);
        match self.lookup(&fingerprint).await {
            Ok(Some(outcome)) => outcome,
            Ok(None) => {
                event!(
                    Level::WARN,
                    %fingerprint,
                    "Rejected public key that matches no user and no build agent"
                );
                AuthOutcome::Rejected
            }
            Err(e) => {
                event!(
                    Level::ERROR,
                    %fingerprint,
                    ?e,
                    "Rejected public key because identity lookup failed"
                );
                AuthOutcome::Rejected
            }
        }
    }

    async fn lookup(&self, fingerprint: &str) -> Result<Option<AuthOutcome>, Error> {
        if let Some(user) = self
            .users
            .find_by_fingerprint(fingerprint)
            .await
            .err_tip(|| "In AuthenticationGate::lookup users")?
        {
            return Ok(Some(AuthOutcome::User(user)));
        }
        let agents = self
            .agents
            .values()
            .await
            .err_tip(|| "In AuthenticationGate::lookup agents")?;
        Ok(agents
            .into_iter()
            .find(|agent| agent.public_key_fingerprint.as_deref() == Some(fingerprint))
            .map(|agent| {
                AuthOutcome::Agent(AgentIdentity {
                    name: agent.name,
                    display_name: agent.display_name,
                })
            }))
    }
}
