use groupsync_core::ids::*;
use groupsync_storage::{InvitationRecord, MembershipRecord, Permission};
use serde::Serialize;
use tracing::info;

use crate::error::SyncError;
use crate::transaction::{Endpoint, RequestContext, UserRequirement};

#[derive(Debug, Clone)]
pub struct CreateSharingGroup {
    pub sharing_group_id: SharingGroupId,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSharingGroupResponse {
    pub sharing_group_id: SharingGroupId,
    pub master_version: u64,
}

impl Endpoint for CreateSharingGroup {
    type Output = CreateSharingGroupResponse;

    fn name(&self) -> &'static str {
        "CreateSharingGroup"
    }

    fn process(&self, ctx: &mut RequestContext<'_, '_>) -> Result<CreateSharingGroupResponse, SyncError> {
        let user_id = ctx.user_id()?;
        ctx.bootstrap_group(self.sharing_group_id, self.name.as_deref(), user_id)?;
        Ok(CreateSharingGroupResponse {
            sharing_group_id: self.sharing_group_id,
            master_version: 0,
        })
    }
}

/// Issues a code that lets another account join the group. Only admins
/// invite.
#[derive(Debug, Clone)]
pub struct CreateSharingInvitation {
    pub sharing_group_id: SharingGroupId,
    pub permission: Permission,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSharingInvitationResponse {
    pub code: InvitationCode,
    pub expiry: i64,
}

impl Endpoint for CreateSharingInvitation {
    type Output = CreateSharingInvitationResponse;

    fn name(&self) -> &'static str {
        "CreateSharingInvitation"
    }

    fn access(&self) -> Option<(SharingGroupId, Permission)> {
        Some((self.sharing_group_id, Permission::Admin))
    }

    fn process(&self, ctx: &mut RequestContext<'_, '_>) -> Result<CreateSharingInvitationResponse, SyncError> {
        let user_id = ctx.user_id()?;
        let sharing = ctx.tx().sharing();
        let inviter = sharing
            .membership(self.sharing_group_id, user_id)?
            .ok_or_else(|| SyncError::Unauthorized(format!("user {user_id} left {}", self.sharing_group_id)))?;
        if self.permission > inviter.permission {
            return Err(SyncError::Unauthorized(format!(
                "cannot grant {} with {} permission",
                self.permission.as_str(),
                inviter.permission.as_str()
            )));
        }

        let lifetime = i64::try_from(ctx.config().invitation_lifetime_secs)
            .map_err(|_| SyncError::Validation("invitation lifetime out of range".into()))?;
        let invitation = InvitationRecord {
            code: InvitationCode::new(),
            sharing_group_id: self.sharing_group_id,
            owning_user_id: user_id,
            permission: self.permission,
            expiry: ctx.now().saturating_add(lifetime),
        };
        sharing.add_invitation(&invitation)?;
        Ok(CreateSharingInvitationResponse {
            code: invitation.code,
            expiry: invitation.expiry,
        })
    }
}

/// Joins the group an invitation names, creating a user for the signed-in
/// account when it has none. Codes are single use.
#[derive(Debug, Clone, Copy)]
pub struct RedeemSharingInvitation {
    pub code: InvitationCode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemSharingInvitationResponse {
    pub sharing_group_id: SharingGroupId,
    pub user_id: UserId,
    pub permission: Permission,
}

impl Endpoint for RedeemSharingInvitation {
    type Output = RedeemSharingInvitationResponse;

    fn name(&self) -> &'static str {
        "RedeemSharingInvitation"
    }

    fn user_requirement(&self) -> UserRequirement {
        UserRequirement::Any
    }

    fn process(&self, ctx: &mut RequestContext<'_, '_>) -> Result<RedeemSharingInvitationResponse, SyncError> {
        let sharing = ctx.tx().sharing();
        let invitation = sharing
            .live_invitation(self.code, ctx.now())?
            .ok_or_else(|| SyncError::Unauthorized(format!("invitation {} is unknown or expired", self.code)))?;

        let user_id = match ctx.user().ok().map(|u| u.user_id) {
            Some(user_id) => user_id,
            None => ctx.register_user()?.user_id,
        };
        if sharing.membership(invitation.sharing_group_id, user_id)?.is_some() {
            return Err(SyncError::Validation(format!(
                "user {user_id} already belongs to {}",
                invitation.sharing_group_id
            )));
        }
        sharing.add_member(MembershipRecord {
            sharing_group_id: invitation.sharing_group_id,
            user_id,
            permission: invitation.permission,
        })?;
        sharing.remove_invitation(self.code)?;

        info!(%user_id, sharing_group_id = %invitation.sharing_group_id, "invitation redeemed");
        Ok(RedeemSharingInvitationResponse {
            sharing_group_id: invitation.sharing_group_id,
            user_id,
            permission: invitation.permission,
        })
    }
}
