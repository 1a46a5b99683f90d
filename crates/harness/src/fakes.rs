use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use groupsync_core::ids::*;
use groupsync_core::{
    AccountDelegate, Authenticator, CloudFileName, CloudStorage, CoreError, Credentials, PushNotificationService,
    VerifiedAccount,
};

fn poisoned(what: &str) -> CoreError {
    CoreError::InvalidData(format!("{what} lock poisoned"))
}

/// Cloud storage held in memory, keyed by the object's cloud name.
#[derive(Debug, Default)]
pub struct MemoryCloudStorage {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    fail_deletes: AtomicBool,
}

impl MemoryCloudStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &CloudFileName) -> Option<Vec<u8>> {
        self.objects.lock().ok()?.get(&name.to_string()).cloned()
    }

    pub fn contains(&self, name: &CloudFileName) -> bool {
        self.get(name).is_some()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().map(|o| o.len()).unwrap_or_default()
    }

    /// Makes every later `delete` fail.
    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::Relaxed);
    }
}

impl CloudStorage for MemoryCloudStorage {
    fn upload(&self, name: &CloudFileName, _mime_type: &str, content: &[u8]) -> Result<ContentHash, CoreError> {
        let mut objects = self.objects.lock().map_err(|_| poisoned("cloud"))?;
        objects.insert(name.to_string(), content.to_vec());
        Ok(ContentHash::of(content))
    }

    fn download(&self, name: &CloudFileName) -> Result<Vec<u8>, CoreError> {
        let objects = self.objects.lock().map_err(|_| poisoned("cloud"))?;
        objects
            .get(&name.to_string())
            .cloned()
            .ok_or_else(|| CoreError::CloudStorage(format!("no object {name}")))
    }

    fn delete(&self, name: &CloudFileName) -> Result<(), CoreError> {
        if self.fail_deletes.load(Ordering::Relaxed) {
            return Err(CoreError::CloudStorage(format!("delete of {name} refused")));
        }
        let mut objects = self.objects.lock().map_err(|_| poisoned("cloud"))?;
        objects.remove(&name.to_string());
        Ok(())
    }
}

/// Accepts any token except `"invalid"`; the token is the account's creds id.
#[derive(Debug, Default)]
pub struct FakeAuthenticator {
    refreshed: Mutex<BTreeMap<String, String>>,
}

impl FakeAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next sign-in of `creds_id` reports refreshed credentials.
    pub fn refresh_on_next_sign_in(&self, creds_id: &str, creds: &str) {
        if let Ok(mut refreshed) = self.refreshed.lock() {
            refreshed.insert(creds_id.to_string(), creds.to_string());
        }
    }
}

impl Authenticator for FakeAuthenticator {
    fn authenticate(&self, credentials: &Credentials) -> Result<VerifiedAccount, CoreError> {
        if credentials.token == "invalid" || credentials.token.is_empty() {
            return Err(CoreError::Unauthenticated(format!(
                "{} token rejected",
                credentials.account_type
            )));
        }
        let refreshed_creds = self
            .refreshed
            .lock()
            .map_err(|_| poisoned("authenticator"))?
            .remove(&credentials.token);
        Ok(VerifiedAccount {
            account_type: credentials.account_type.clone(),
            creds_id: credentials.token.clone(),
            refreshed_creds,
        })
    }
}

#[derive(Debug, Default)]
pub struct RecordingAccountDelegate {
    saved: Mutex<Vec<(UserId, String)>>,
}

impl RecordingAccountDelegate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saved(&self) -> Vec<(UserId, String)> {
        self.saved.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl AccountDelegate for RecordingAccountDelegate {
    fn save_credentials(&self, user_id: UserId, creds: &str) -> Result<(), CoreError> {
        self.saved
            .lock()
            .map_err(|_| poisoned("account delegate"))?
            .push((user_id, creds.to_string()));
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingPush {
    published: Mutex<Vec<(SharingGroupId, String)>>,
    fail: AtomicBool,
}

impl RecordingPush {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<(SharingGroupId, String)> {
        self.published.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }
}

impl PushNotificationService for RecordingPush {
    fn publish(&self, sharing_group_id: SharingGroupId, message: &str) -> Result<(), CoreError> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(CoreError::CloudStorage("push service unavailable".into()));
        }
        self.published
            .lock()
            .map_err(|_| poisoned("push"))?
            .push((sharing_group_id, message.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cloud_round_trip_and_delete() -> Result<(), CoreError> {
        let cloud = MemoryCloudStorage::new();
        let name = CloudFileName::new(UserId::new(), DeviceId::new(), FileId::new(), 0);
        let hash = cloud.upload(&name, "text/plain", b"Hello")?;
        assert_eq!(hash, ContentHash::of(b"Hello"));
        assert!(cloud.contains(&name));
        assert_eq!(cloud.download(&name)?, b"Hello");
        // Same file from another device is a separate object.
        let other = CloudFileName::new(name.owner_user_id, DeviceId::new(), name.file_id, 0);
        assert!(!cloud.contains(&other));
        cloud.delete(&name)?;
        assert!(!cloud.contains(&name));
        Ok(())
    }

    #[test]
    fn refreshed_creds_are_reported_once() -> Result<(), CoreError> {
        let auth = FakeAuthenticator::new();
        auth.refresh_on_next_sign_in("alice", "new-token");
        let creds = Credentials {
            account_type: "Google".into(),
            token: "alice".into(),
        };
        assert_eq!(auth.authenticate(&creds)?.refreshed_creds.as_deref(), Some("new-token"));
        assert_eq!(auth.authenticate(&creds)?.refreshed_creds, None);
        Ok(())
    }
}
