use groupsync_core::ids::*;
use groupsync_engine::{
    AddUser, CreateSharingGroup, CreateSharingInvitation, GetFileIndex, RedeemSharingInvitation, RemoveUser,
    StatusCategory, SyncError,
};
use groupsync_harness::{TestConfig, TestDeployment};
use groupsync_storage::Permission;

type TestResult = Result<(), Box<dyn std::error::Error>>;

// ============================================================================
// Users and devices (8 tests)
// ============================================================================

#[test]
fn add_user_creates_first_group() -> TestResult {
    let deployment = TestDeployment::new()?;
    let (device, group) = deployment.user_with_group("alice")?;
    let index = device.file_index(group)?;
    assert_eq!(index.master_version, 0);
    assert!(index.files.is_empty());
    Ok(())
}

#[test]
fn second_add_user_for_same_account_is_rejected() -> TestResult {
    let deployment = TestDeployment::new()?;
    let (device, _) = deployment.user_with_group("alice")?;
    let err = device
        .call(&AddUser {
            sharing_group_id: SharingGroupId::new(),
            sharing_group_name: None,
        })
        .unwrap_err();
    assert!(matches!(err, SyncError::Validation(_)));
    Ok(())
}

#[test]
fn unknown_account_and_bad_token_are_unauthorized() -> TestResult {
    let deployment = TestDeployment::new()?;
    let (_, group) = deployment.user_with_group("alice")?;

    let stranger = deployment.device("mallory");
    let err = stranger.file_index(group).unwrap_err();
    assert_eq!(err.category(), StatusCategory::Unauthorized);

    let forged = deployment.device("invalid");
    let err = forged.file_index(group).unwrap_err();
    assert!(matches!(err, SyncError::Unauthorized(_)));
    Ok(())
}

#[test]
fn non_member_cannot_read_group() -> TestResult {
    let deployment = TestDeployment::new()?;
    let (_, alice_group) = deployment.user_with_group("alice")?;
    let (bob, _) = deployment.user_with_group("bob")?;
    assert!(matches!(bob.file_index(alice_group), Err(SyncError::Unauthorized(_))));
    Ok(())
}

#[test]
fn unknown_group_is_a_validation_error() -> TestResult {
    let deployment = TestDeployment::new()?;
    let (device, _) = deployment.user_with_group("alice")?;
    assert!(matches!(
        device.file_index(SharingGroupId::new()),
        Err(SyncError::Validation(_))
    ));
    Ok(())
}

#[test]
fn device_limit_is_enforced() -> TestResult {
    let config = TestConfig::from_toml_str("max_devices_per_user = 2")?;
    let deployment = TestDeployment::with_config(config)?;
    let (first, group) = deployment.user_with_group("alice")?;
    let second = first.sibling();
    second.file_index(group)?;

    let third = first.sibling();
    assert!(matches!(third.file_index(group), Err(SyncError::Validation(_))));
    // Known devices keep working.
    first.file_index(group)?;
    Ok(())
}

#[test]
fn device_of_another_user_is_rejected() -> TestResult {
    let deployment = TestDeployment::new()?;
    let (alice, alice_group) = deployment.user_with_group("alice")?;
    let (_, bob_group) = deployment.user_with_group("bob")?;
    let mut borrowed = deployment.device("bob");
    borrowed.header.device_id = alice.device_id();

    assert!(matches!(borrowed.file_index(bob_group), Err(SyncError::Unauthorized(_))));
    alice.file_index(alice_group)?;
    Ok(())
}

#[test]
fn refreshed_credentials_are_saved_after_commit() -> TestResult {
    let deployment = TestDeployment::new()?;
    let (device, group) = deployment.user_with_group("alice")?;
    deployment.authenticator.refresh_on_next_sign_in("alice", "fresh-token");
    device.file_index(group)?;

    let saved = deployment.account_delegate.saved();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].1, "fresh-token");

    // Same creds on the next request: nothing more to save.
    deployment.authenticator.refresh_on_next_sign_in("alice", "fresh-token");
    device.file_index(group)?;
    assert_eq!(deployment.account_delegate.saved().len(), 1);
    Ok(())
}

// ============================================================================
// Sharing groups and invitations (6 tests)
// ============================================================================

#[test]
fn create_sharing_group_starts_at_version_zero() -> TestResult {
    let deployment = TestDeployment::new()?;
    let (device, first_group) = deployment.user_with_group("alice")?;
    let group = SharingGroupId::new();
    let created = device.call(&CreateSharingGroup {
        sharing_group_id: group,
        name: Some("photos".into()),
    })?;
    assert_eq!(created.master_version, 0);
    assert_eq!(device.master_version(group)?, 0);

    let err = device
        .call(&CreateSharingGroup {
            sharing_group_id: first_group,
            name: None,
        })
        .unwrap_err();
    assert!(matches!(err, SyncError::Validation(_)));
    Ok(())
}

#[test]
fn invitation_adds_new_user_with_granted_permission() -> TestResult {
    let deployment = TestDeployment::new()?;
    let (alice, group) = deployment.user_with_group("alice")?;
    let file = FileId::new();
    alice.upload_new(group, file, None, b"shared")?;
    alice.done_uploads(group)?;

    let invitation = alice.call(&CreateSharingInvitation {
        sharing_group_id: group,
        permission: Permission::Write,
    })?;
    let carol = deployment.device("carol");
    let redeemed = carol.call(&RedeemSharingInvitation { code: invitation.code })?;
    assert_eq!(redeemed.sharing_group_id, group);
    assert_eq!(redeemed.permission, Permission::Write);

    let index = carol.file_index(group)?;
    assert_eq!(index.files.len(), 1);
    assert_eq!(index.files[0].file_id, file);

    // Codes are single use.
    let dave = deployment.device("dave");
    let err = dave.call(&RedeemSharingInvitation { code: invitation.code }).unwrap_err();
    assert_eq!(err.category(), StatusCategory::Unauthorized);
    Ok(())
}

#[test]
fn expired_invitation_is_rejected() -> TestResult {
    let config = TestConfig::from_toml_str("invitation_lifetime_secs = 0")?;
    let deployment = TestDeployment::with_config(config)?;
    let (alice, group) = deployment.user_with_group("alice")?;
    let invitation = alice.call(&CreateSharingInvitation {
        sharing_group_id: group,
        permission: Permission::Read,
    })?;
    let carol = deployment.device("carol");
    assert!(matches!(
        carol.call(&RedeemSharingInvitation { code: invitation.code }),
        Err(SyncError::Unauthorized(_))
    ));
    Ok(())
}

#[test]
fn only_admins_invite() -> TestResult {
    let deployment = TestDeployment::new()?;
    let (alice, group) = deployment.user_with_group("alice")?;
    let invitation = alice.call(&CreateSharingInvitation {
        sharing_group_id: group,
        permission: Permission::Write,
    })?;
    let carol = deployment.device("carol");
    carol.call(&RedeemSharingInvitation { code: invitation.code })?;

    let err = carol
        .call(&CreateSharingInvitation {
            sharing_group_id: group,
            permission: Permission::Read,
        })
        .unwrap_err();
    assert!(matches!(err, SyncError::Unauthorized(_)));
    Ok(())
}

#[test]
fn existing_member_cannot_redeem_again() -> TestResult {
    let deployment = TestDeployment::new()?;
    let (alice, group) = deployment.user_with_group("alice")?;
    let invitation = alice.call(&CreateSharingInvitation {
        sharing_group_id: group,
        permission: Permission::Read,
    })?;
    let err = alice.call(&RedeemSharingInvitation { code: invitation.code }).unwrap_err();
    assert!(matches!(err, SyncError::Validation(_)));
    Ok(())
}

#[test]
fn read_permission_cannot_upload() -> TestResult {
    let deployment = TestDeployment::new()?;
    let (alice, group) = deployment.user_with_group("alice")?;
    let invitation = alice.call(&CreateSharingInvitation {
        sharing_group_id: group,
        permission: Permission::Read,
    })?;
    let (bob, _) = deployment.user_with_group("bob")?;
    bob.call(&RedeemSharingInvitation { code: invitation.code })?;

    bob.file_index(group)?;
    assert!(matches!(
        bob.upload_new(group, FileId::new(), None, b"nope"),
        Err(SyncError::Unauthorized(_))
    ));
    assert_eq!(deployment.counts()?.uploads, 0);
    Ok(())
}

// ============================================================================
// RemoveUser (2 tests)
// ============================================================================

#[test]
fn remove_user_cascades_and_keeps_catalog_rows() -> TestResult {
    let deployment = TestDeployment::new()?;
    let (alice, group) = deployment.user_with_group("alice")?;
    let invitation = alice.call(&CreateSharingInvitation {
        sharing_group_id: group,
        permission: Permission::Write,
    })?;
    let bob = deployment.device("bob");
    bob.call(&RedeemSharingInvitation { code: invitation.code })?;

    let committed = FileId::new();
    alice.upload_new(group, committed, None, b"Hello")?;
    alice.done_uploads(group)?;
    alice.upload_change(group, committed, 1, b"!")?;
    alice.done_uploads(group)?;
    alice.upload_new(group, FileId::new(), None, b"staged")?;
    alice.call(&CreateSharingInvitation {
        sharing_group_id: group,
        permission: Permission::Read,
    })?;

    let removed = alice.call(&RemoveUser)?;
    assert_eq!(removed.devices, 1);
    assert_eq!(removed.uploads, 1);
    assert_eq!(removed.deferred_uploads, 1);
    assert_eq!(removed.files_deleted, 1);
    assert_eq!(removed.memberships, 1);
    assert_eq!(removed.invitations, 1);

    let counts = deployment.counts()?;
    assert_eq!(counts.uploads, 0);
    assert_eq!(counts.deferred_uploads, 0);
    assert_eq!(counts.file_index, 1);

    // Bob still sees the file, now marked deleted.
    let index = bob.file_index(group)?;
    assert_eq!(index.files.len(), 1);
    assert!(index.files[0].deleted);
    Ok(())
}

#[test]
fn removed_user_must_sign_up_again() -> TestResult {
    let deployment = TestDeployment::new()?;
    let (alice, group) = deployment.user_with_group("alice")?;
    alice.call(&RemoveUser)?;

    assert!(matches!(alice.call(&RemoveUser), Err(SyncError::Unauthorized(_))));
    assert!(matches!(
        alice.call(&GetFileIndex { sharing_group_id: group }),
        Err(SyncError::Unauthorized(_))
    ));

    // The account can register again, on the same device.
    alice.call(&AddUser {
        sharing_group_id: SharingGroupId::new(),
        sharing_group_name: None,
    })?;
    Ok(())
}
