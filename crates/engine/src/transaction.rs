use groupsync_core::ids::*;
use groupsync_core::time::unix_now;
use groupsync_core::{CloudFileName, Credentials, ResolverRegistry, SyncConfig, VerifiedAccount};
use groupsync_storage::{
    DeviceRecord, MembershipRecord, Permission, StorageError, StoreTx, TxMode, UserRecord,
};
use tracing::{debug, info_span, warn};

use crate::error::SyncError;
use crate::server::SyncServer;

/// Steps every request moves through, in order. A failure at any step jumps
/// to `Rollback`; the response is only produced after `Commit` or `Rollback`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    Authenticate,
    BeginTransaction,
    ValidateDeviceId,
    AcquireGroupLock,
    ProcessRequest,
    Commit,
    Rollback,
    Respond,
}

/// Whether the signed-in account must already have a user record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserRequirement {
    Existing,
    Absent,
    Any,
}

#[derive(Debug, Clone)]
pub struct RequestHeader {
    pub credentials: Credentials,
    pub device_id: DeviceId,
}

/// One client-facing operation.
pub trait Endpoint {
    type Output;

    fn name(&self) -> &'static str;

    fn user_requirement(&self) -> UserRequirement {
        UserRequirement::Existing
    }

    /// The sharing group the request acts on, and the membership level it needs.
    fn access(&self) -> Option<(SharingGroupId, Permission)> {
        None
    }

    /// Take the group lock of `access()` before processing.
    fn locks_group(&self) -> bool {
        false
    }

    fn tx_mode(&self) -> TxMode {
        TxMode::Immediate
    }

    fn process(&self, ctx: &mut RequestContext<'_, '_>) -> Result<Self::Output, SyncError>;
}

/// Side effects outside the store, run only once the transaction committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PostCommit {
    DeleteCloudObject(CloudFileName),
    Publish {
        sharing_group_id: SharingGroupId,
        message: String,
    },
    SaveCredentials {
        user_id: UserId,
        creds: String,
    },
}

/// What an endpoint sees while its transaction is open.
pub struct RequestContext<'r, 'conn> {
    tx: &'r StoreTx<'conn>,
    server: &'r SyncServer,
    account: &'r VerifiedAccount,
    device_id: DeviceId,
    user: Option<UserRecord>,
    now: i64,
    post_commit: Vec<PostCommit>,
}

impl<'r, 'conn> RequestContext<'r, 'conn> {
    pub fn tx(&self) -> &'r StoreTx<'conn> {
        self.tx
    }

    pub fn server(&self) -> &'r SyncServer {
        self.server
    }

    pub fn config(&self) -> &SyncConfig {
        self.server.config()
    }

    pub fn resolvers(&self) -> &ResolverRegistry {
        self.server.resolvers()
    }

    pub fn account(&self) -> &VerifiedAccount {
        self.account
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn now(&self) -> i64 {
        self.now
    }

    pub fn user(&self) -> Result<&UserRecord, SyncError> {
        self.user
            .as_ref()
            .ok_or_else(|| SyncError::Unauthorized(format!("no user for {} account", self.account.account_type)))
    }

    pub fn user_id(&self) -> Result<UserId, SyncError> {
        Ok(self.user()?.user_id)
    }

    /// Read-only master version check used by every mutating file endpoint.
    pub fn check_master_version(&self, sharing_group_id: SharingGroupId, expected: u64) -> Result<u64, SyncError> {
        let current = self.tx.master_versions().get(sharing_group_id)?;
        if current != expected {
            debug!(%sharing_group_id, expected, current, "stale master version");
            return Err(SyncError::MasterVersionConflict { current });
        }
        Ok(current)
    }

    /// Creates a user for the signed-in account and registers the calling
    /// device to it.
    pub fn register_user(&mut self) -> Result<UserRecord, SyncError> {
        if self.user.is_some() {
            return Err(SyncError::Validation(format!(
                "{} account {} already has a user",
                self.account.account_type, self.account.creds_id
            )));
        }
        let user = UserRecord {
            user_id: UserId::new(),
            account_type: self.account.account_type.clone(),
            creds_id: self.account.creds_id.clone(),
            creds: self.account.refreshed_creds.clone(),
        };
        self.tx.users().add(&user).map_err(|e| match e {
            StorageError::ConstraintViolation(msg) => SyncError::Validation(msg),
            other => other.into(),
        })?;
        self.validate_device(user.user_id)?;
        self.user = Some(user.clone());
        Ok(user)
    }

    /// Creates a sharing group with everything its lock and version protocol
    /// needs, and makes `admin` its first member.
    pub fn bootstrap_group(
        &mut self,
        sharing_group_id: SharingGroupId,
        name: Option<&str>,
        admin: UserId,
    ) -> Result<(), SyncError> {
        let sharing = self.tx.sharing();
        sharing.create_group(sharing_group_id, name).map_err(|e| match e {
            StorageError::ConstraintViolation(msg) => SyncError::Validation(msg),
            other => other.into(),
        })?;
        self.tx.master_versions().create(sharing_group_id)?;
        self.tx.group_locks().create(sharing_group_id)?;
        sharing.add_member(MembershipRecord {
            sharing_group_id,
            user_id: admin,
            permission: Permission::Admin,
        })?;
        debug!(%sharing_group_id, %admin, "sharing group created");
        Ok(())
    }

    pub(crate) fn after_commit(&mut self, action: PostCommit) {
        self.post_commit.push(action);
    }

    fn resolve_user(&mut self, requirement: UserRequirement) -> Result<(), SyncError> {
        let account = self.account;
        let user = self.tx.users().lookup_by_creds(&account.account_type, &account.creds_id)?;
        match (requirement, &user) {
            (UserRequirement::Existing, None) => {
                return Err(SyncError::Unauthorized(format!(
                    "{} account {} has no user",
                    account.account_type, account.creds_id
                )));
            }
            (UserRequirement::Absent, Some(_)) => {
                return Err(SyncError::Validation(format!(
                    "{} account {} already has a user",
                    account.account_type, account.creds_id
                )));
            }
            _ => {}
        }
        if let Some(user) = &user
            && let Some(creds) = &account.refreshed_creds
            && user.creds.as_ref() != Some(creds)
        {
            self.tx.users().update_creds(user.user_id, creds)?;
            self.after_commit(PostCommit::SaveCredentials {
                user_id: user.user_id,
                creds: creds.clone(),
            });
        }
        self.user = user;
        Ok(())
    }

    /// The device must belong to the user; an unseen device is registered
    /// while the user is under the device limit.
    fn validate_device(&self, user_id: UserId) -> Result<(), SyncError> {
        let devices = self.tx.devices();
        match devices.lookup(self.device_id)? {
            Some(device) if device.user_id == user_id => Ok(()),
            Some(_) => Err(SyncError::Unauthorized(format!(
                "device {} belongs to another user",
                self.device_id
            ))),
            None => {
                let limit = self.config().max_devices_per_user;
                if devices.count_for_user(user_id)? >= limit {
                    return Err(SyncError::Validation(format!("user {user_id} already has {limit} devices")));
                }
                devices.add(DeviceRecord {
                    device_id: self.device_id,
                    user_id,
                })?;
                debug!(device_id = %self.device_id, %user_id, "device registered");
                Ok(())
            }
        }
    }

    fn check_membership(&self, sharing_group_id: SharingGroupId, required: Permission) -> Result<(), SyncError> {
        let user_id = self.user_id()?;
        let membership = self.tx.sharing().membership(sharing_group_id, user_id)?;
        match membership {
            Some(m) if m.permission >= required => Ok(()),
            Some(m) => Err(SyncError::Unauthorized(format!(
                "user {user_id} has {} permission in {sharing_group_id}, needs {}",
                m.permission.as_str(),
                required.as_str()
            ))),
            None if self.tx.sharing().group(sharing_group_id)?.is_none() => {
                Err(SyncError::Validation(format!("no sharing group {sharing_group_id}")))
            }
            None => Err(SyncError::Unauthorized(format!(
                "user {user_id} is not a member of {sharing_group_id}"
            ))),
        }
    }
}

/// Drives one request through its stages.
pub struct RequestTransaction<'s> {
    server: &'s SyncServer,
    stage: Stage,
}

impl<'s> RequestTransaction<'s> {
    pub fn new(server: &'s SyncServer) -> Self {
        Self {
            server,
            stage: Stage::Init,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    fn enter(&mut self, stage: Stage) {
        debug!(from = ?self.stage, to = ?stage, "request stage");
        self.stage = stage;
    }

    pub fn run<E: Endpoint>(mut self, header: &RequestHeader, endpoint: &E) -> Result<E::Output, SyncError> {
        let server = self.server;
        let access = endpoint.access();
        let span = info_span!(
            "request",
            endpoint = endpoint.name(),
            sharing_group = ?access.map(|(g, _)| g),
            device = %header.device_id,
        );
        let _guard = span.enter();

        self.enter(Stage::Authenticate);
        let account = server.services().authenticator.authenticate(&header.credentials)?;

        self.enter(Stage::BeginTransaction);
        let mut conn = server.store().connect()?;
        let tx = StoreTx::begin(&mut conn, endpoint.tx_mode())?;

        let mut ctx = RequestContext {
            tx: &tx,
            server,
            account: &account,
            device_id: header.device_id,
            user: None,
            now: unix_now()?,
            post_commit: Vec::new(),
        };
        let result = self.process(&mut ctx, endpoint);
        let post_commit = std::mem::take(&mut ctx.post_commit);

        let metrics = server.metrics();
        match result {
            Ok(output) => {
                self.enter(Stage::Commit);
                if let Err(e) = tx.commit() {
                    metrics.request_rolled_back();
                    warn!(error = %e, "commit failed");
                    return Err(SyncError::Transaction(e.to_string()));
                }
                metrics.request_committed();
                self.run_post_commit(post_commit);
                self.enter(Stage::Respond);
                Ok(output)
            }
            Err(err) => {
                self.enter(Stage::Rollback);
                if let Err(e) = tx.rollback() {
                    warn!(error = %e, "rollback failed");
                }
                metrics.request_rolled_back();
                debug!(error = %err, "request rolled back");
                self.enter(Stage::Respond);
                Err(err)
            }
        }
    }

    fn process<E: Endpoint>(&mut self, ctx: &mut RequestContext<'_, '_>, endpoint: &E) -> Result<E::Output, SyncError> {
        ctx.resolve_user(endpoint.user_requirement())?;

        self.enter(Stage::ValidateDeviceId);
        if let Some(user) = &ctx.user {
            ctx.validate_device(user.user_id)?;
        }

        if let Some((sharing_group_id, permission)) = endpoint.access() {
            if endpoint.locks_group() {
                self.enter(Stage::AcquireGroupLock);
                ctx.tx.group_locks().acquire(sharing_group_id).map_err(|e| match e {
                    StorageError::NotFound(_) => {
                        SyncError::Validation(format!("no sharing group {sharing_group_id}"))
                    }
                    other => other.into(),
                })?;
            }
            ctx.check_membership(sharing_group_id, permission)?;
        }

        self.enter(Stage::ProcessRequest);
        endpoint.process(ctx)
    }

    fn run_post_commit(&self, actions: Vec<PostCommit>) {
        let services = self.server.services();
        for action in actions {
            let outcome = match &action {
                PostCommit::DeleteCloudObject(name) => services.cloud_storage.delete(name),
                PostCommit::Publish {
                    sharing_group_id,
                    message,
                } => services.push.publish(*sharing_group_id, message),
                PostCommit::SaveCredentials { user_id, creds } => {
                    services.account_delegate.save_credentials(*user_id, creds)
                }
            };
            if let Err(e) = outcome {
                warn!(?action, error = %e, "post-commit action failed");
            }
        }
    }
}
