use groupsync_core::ids::*;
use groupsync_storage::DeletionCriteria;
use serde::Serialize;
use tracing::info;

use crate::error::SyncError;
use crate::transaction::{Endpoint, RequestContext, UserRequirement};

/// Registers the signed-in account as a new user with a first sharing group.
#[derive(Debug, Clone)]
pub struct AddUser {
    pub sharing_group_id: SharingGroupId,
    pub sharing_group_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddUserResponse {
    pub user_id: UserId,
}

impl Endpoint for AddUser {
    type Output = AddUserResponse;

    fn name(&self) -> &'static str {
        "AddUser"
    }

    fn user_requirement(&self) -> UserRequirement {
        UserRequirement::Absent
    }

    fn process(&self, ctx: &mut RequestContext<'_, '_>) -> Result<AddUserResponse, SyncError> {
        let user = ctx.register_user()?;
        ctx.bootstrap_group(self.sharing_group_id, self.sharing_group_name.as_deref(), user.user_id)?;
        info!(user_id = %user.user_id, account_type = %user.account_type, "user added");
        Ok(AddUserResponse { user_id: user.user_id })
    }
}

/// Removes the signed-in user. Catalog rows they own are soft-deleted, never
/// removed.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveUser;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveUserResponse {
    pub devices: usize,
    pub uploads: usize,
    pub deferred_uploads: usize,
    pub files_deleted: usize,
    pub memberships: usize,
    pub invitations: usize,
}

impl Endpoint for RemoveUser {
    type Output = RemoveUserResponse;

    fn name(&self) -> &'static str {
        "RemoveUser"
    }

    fn process(&self, ctx: &mut RequestContext<'_, '_>) -> Result<RemoveUserResponse, SyncError> {
        let user_id = ctx.user_id()?;
        let tx = ctx.tx();

        // Order matters; every step is a no-op when repeated.
        let removed = RemoveUserResponse {
            devices: tx.devices().remove_for_user(user_id)?,
            uploads: tx.uploads().remove_for_owner(user_id)?,
            deferred_uploads: tx.deferred_uploads().remove_for_owner(user_id)?,
            files_deleted: tx.file_index().mark_deleted(DeletionCriteria::Owner(user_id), ctx.now())?,
            memberships: tx.sharing().remove_memberships_for_user(user_id)?,
            invitations: tx.sharing().remove_invitations_owned_by(user_id)?,
        };
        tx.users().remove(user_id)?;

        info!(%user_id, ?removed, "user removed");
        Ok(removed)
    }
}
