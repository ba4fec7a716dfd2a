//! In-memory collaborators with call counters for unit tests

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use super::exchange::{AssertionSource, AssertionUnavailable, TokenExchanger};
use super::identity::{
    DirectoryError, IdentityDirectory, CLIENT_ID_ANNOTATION, TENANT_ID_ANNOTATION,
};
use super::publisher::{CredentialStore, StoreError};
use super::types::{FederatedAccessToken, IdentityBinding, TokenRefreshError};

/// Kubernetes client whose API server is the given mock server
pub fn kube_client(server: &wiremock::MockServer) -> kube::Client {
    let config = kube::Config::new(server.uri().parse().unwrap());
    kube::Client::try_from(config).unwrap()
}

/// `Status` body the API server returns for a failed request
pub fn api_status(code: u16, reason: &str, message: &str) -> Value {
    serde_json::json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": message,
        "reason": reason,
        "code": code,
    })
}

/// Directory holding at most one ServiceAccount
#[derive(Default)]
pub struct FakeDirectory {
    annotations: Option<BTreeMap<String, String>>,
    token: Option<Result<String, String>>,
    lookups: AtomicUsize,
    issued: Mutex<Vec<Vec<String>>>,
}

impl FakeDirectory {
    pub fn missing() -> Self {
        Self::default()
    }

    pub fn with_annotations<const N: usize>(annotations: [(&str, &str); N]) -> Self {
        Self {
            annotations: Some(
                annotations
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    pub fn annotated(tenant_id: &str, client_id: &str) -> Self {
        Self::with_annotations([
            (TENANT_ID_ANNOTATION, tenant_id),
            (CLIENT_ID_ANNOTATION, client_id),
        ])
    }

    pub fn issuing(mut self, token: &str) -> Self {
        self.token = Some(Ok(token.to_string()));
        self
    }

    pub fn failing_issuance(mut self, reason: &str) -> Self {
        self.token = Some(Err(reason.to_string()));
        self
    }

    pub fn lookup_calls(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn issue_calls(&self) -> usize {
        self.issued.lock().unwrap().len()
    }

    pub fn issued_audiences(&self) -> Vec<Vec<String>> {
        self.issued.lock().unwrap().clone()
    }
}

#[async_trait]
impl IdentityDirectory for FakeDirectory {
    async fn lookup_principal(
        &self,
        _namespace: &str,
        _name: &str,
    ) -> Result<BTreeMap<String, String>, DirectoryError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.annotations.clone().ok_or(DirectoryError::NotFound)
    }

    async fn issue_token(
        &self,
        _namespace: &str,
        _name: &str,
        audiences: &[String],
    ) -> Result<String, DirectoryError> {
        self.issued.lock().unwrap().push(audiences.to_vec());
        match &self.token {
            Some(Ok(token)) => Ok(token.clone()),
            Some(Err(reason)) => Err(DirectoryError::Request(reason.clone())),
            None => Err(DirectoryError::NotFound),
        }
    }
}

/// Fixed assertion that counts how often it is asked for
pub struct CountingAssertion {
    value: String,
    calls: AtomicUsize,
}

impl CountingAssertion {
    pub fn new(value: &str) -> Self {
        Self {
            value: value.to_string(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AssertionSource for CountingAssertion {
    async fn provide(&self) -> Result<SecretString, AssertionUnavailable> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(SecretString::new(self.value.clone()))
    }
}

pub struct FailingAssertion;

#[async_trait]
impl AssertionSource for FailingAssertion {
    async fn provide(&self) -> Result<SecretString, AssertionUnavailable> {
        Err(AssertionUnavailable("token file missing".to_string()))
    }
}

/// How a `FakeExchanger` answers
pub enum ExchangeBehavior {
    Issue(String),
    Reject(String),
    /// Cancel the run's token, then never complete
    CancelAndHang(CancellationToken),
}

pub struct FakeExchanger {
    behavior: ExchangeBehavior,
    calls: AtomicUsize,
    seen: Mutex<Vec<(IdentityBinding, String)>>,
}

impl FakeExchanger {
    pub fn new(behavior: ExchangeBehavior) -> Self {
        Self {
            behavior,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Bindings and assertions received, in call order
    pub fn seen(&self) -> Vec<(IdentityBinding, String)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl TokenExchanger for FakeExchanger {
    async fn exchange(
        &self,
        binding: &IdentityBinding,
        assertion: &dyn AssertionSource,
    ) -> Result<FederatedAccessToken, TokenRefreshError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let assertion = assertion
            .provide()
            .await
            .map_err(|e| TokenRefreshError::ExchangeFailed(e.to_string()))?;
        self.seen
            .lock()
            .unwrap()
            .push((binding.clone(), assertion.expose_secret().clone()));

        match &self.behavior {
            ExchangeBehavior::Issue(token) => Ok(FederatedAccessToken::new(token.clone(), Some(3599))),
            ExchangeBehavior::Reject(reason) => Err(TokenRefreshError::ExchangeFailed(reason.clone())),
            ExchangeBehavior::CancelAndHang(cancel) => {
                cancel.cancel();
                std::future::pending().await
            }
        }
    }
}

/// Secret store applying JSON merge patches (RFC 7386) to stored Secrets
#[derive(Default)]
pub struct MemorySecretStore {
    secrets: Mutex<BTreeMap<(String, String), Secret>>,
    patches: AtomicUsize,
    fail_with: Option<String>,
}

impl MemorySecretStore {
    pub fn with_secret<const N: usize>(namespace: &str, name: &str, data: [(&str, &str); N]) -> Self {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                resource_version: Some("1".to_string()),
                ..Default::default()
            },
            data: Some(
                data.into_iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                    .collect(),
            ),
            ..Default::default()
        };

        let store = Self::default();
        store
            .secrets
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name.to_string()), secret);
        store
    }

    pub fn failing(mut self, reason: &str) -> Self {
        self.fail_with = Some(reason.to_string());
        self
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.secrets
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Decoded value of one data field
    pub fn field(&self, namespace: &str, name: &str, key: &str) -> Option<String> {
        let secret = self.get(namespace, name)?;
        let value = secret.data?.remove(key)?;
        String::from_utf8(value.0).ok()
    }

    pub fn patch_calls(&self) -> usize {
        self.patches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialStore for MemorySecretStore {
    async fn patch_secret(
        &self,
        namespace: &str,
        name: &str,
        merge_patch: &Value,
    ) -> Result<Secret, StoreError> {
        self.patches.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = &self.fail_with {
            return Err(StoreError(reason.clone()));
        }

        let mut secrets = self.secrets.lock().unwrap();
        let key = (namespace.to_string(), name.to_string());
        let current = secrets
            .get(&key)
            .ok_or_else(|| StoreError(format!("secrets \"{}\" not found", name)))?;

        let mut document = serde_json::to_value(current).map_err(|e| StoreError(e.to_string()))?;
        merge(&mut document, merge_patch);
        let updated: Secret =
            serde_json::from_value(document).map_err(|e| StoreError(e.to_string()))?;

        secrets.insert(key, updated.clone());
        Ok(updated)
    }
}

fn merge(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target) = target {
        for (key, value) in patch {
            if value.is_null() {
                target.remove(key);
            } else {
                merge(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}
