use std::sync::Arc;

use groupsync_core::ids::*;
use groupsync_core::{Credentials, ResolverRegistry};
use groupsync_engine::{
    AddUser, DoneUploads, DoneUploadsResponse, Endpoint, FileIndexResponse, GetFileIndex, RequestHeader, Services,
    SyncError, SyncServer, UploadDeletion, UploadDeletionResponse, UploadFile, UploadFileResponse,
};
use groupsync_storage::{DeferredUploadRepo, FileIndexRepo, UploadRepo};
use tempfile::TempDir;

use crate::config::TestConfig;
use crate::fakes::{FakeAuthenticator, MemoryCloudStorage, RecordingAccountDelegate, RecordingPush};

pub const TEST_ACCOUNT_TYPE: &str = "Google";

/// Row counts of the tables a batch touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowCounts {
    pub uploads: u64,
    pub file_index: u64,
    /// Changes still waiting for the Uploader.
    pub deferred_uploads: u64,
}

/// A server over a file-backed store in a temporary directory, with
/// in-memory collaborators the test can inspect.
pub struct TestDeployment {
    pub server: Arc<SyncServer>,
    pub cloud: Arc<MemoryCloudStorage>,
    pub push: Arc<RecordingPush>,
    pub authenticator: Arc<FakeAuthenticator>,
    pub account_delegate: Arc<RecordingAccountDelegate>,
    _dir: TempDir,
}

impl TestDeployment {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        Self::with_resolvers(TestConfig::default(), ResolverRegistry::with_builtins())
    }

    pub fn with_config(config: TestConfig) -> Result<Self, Box<dyn std::error::Error>> {
        Self::with_resolvers(config, ResolverRegistry::with_builtins())
    }

    pub fn with_resolvers(
        config: TestConfig,
        resolvers: ResolverRegistry,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        crate::init_test_logging();
        let dir = tempfile::tempdir()?;
        let cloud = Arc::new(MemoryCloudStorage::new());
        let push = Arc::new(RecordingPush::new());
        let authenticator = Arc::new(FakeAuthenticator::new());
        let account_delegate = Arc::new(RecordingAccountDelegate::new());
        let services = Services {
            cloud_storage: cloud.clone(),
            authenticator: authenticator.clone(),
            account_delegate: account_delegate.clone(),
            push: push.clone(),
        };
        let sync_config = config.sync_config(&dir.path().join("groupsync.db"));
        let server = SyncServer::open(sync_config, services, resolvers)?;
        Ok(Self {
            server: Arc::new(server),
            cloud,
            push,
            authenticator,
            account_delegate,
            _dir: dir,
        })
    }

    /// A device signing in as `creds_id`. Each call makes a new device.
    pub fn device(&self, creds_id: &str) -> TestDevice {
        TestDevice {
            server: self.server.clone(),
            header: RequestHeader {
                credentials: Credentials {
                    account_type: TEST_ACCOUNT_TYPE.into(),
                    token: creds_id.into(),
                },
                device_id: DeviceId::new(),
            },
        }
    }

    /// A new user with a first sharing group, and the device that created it.
    pub fn user_with_group(&self, creds_id: &str) -> Result<(TestDevice, SharingGroupId), SyncError> {
        let device = self.device(creds_id);
        let group = SharingGroupId::new();
        device.call(&AddUser {
            sharing_group_id: group,
            sharing_group_name: Some(format!("{creds_id}'s files")),
        })?;
        Ok((device, group))
    }

    pub fn counts(&self) -> Result<RowCounts, Box<dyn std::error::Error>> {
        let conn = self.server.store().connect()?;
        Ok(RowCounts {
            uploads: UploadRepo::new(&conn).count()?,
            file_index: FileIndexRepo::new(&conn).count()?,
            deferred_uploads: DeferredUploadRepo::new(&conn).count_pending()?,
        })
    }
}

#[derive(Clone)]
pub struct TestDevice {
    pub server: Arc<SyncServer>,
    pub header: RequestHeader,
}

impl TestDevice {
    pub fn device_id(&self) -> DeviceId {
        self.header.device_id
    }

    /// Another device of the same account.
    pub fn sibling(&self) -> TestDevice {
        TestDevice {
            server: self.server.clone(),
            header: RequestHeader {
                credentials: self.header.credentials.clone(),
                device_id: DeviceId::new(),
            },
        }
    }

    pub fn call<E: Endpoint>(&self, endpoint: &E) -> Result<E::Output, SyncError> {
        self.server.handle(&self.header, endpoint)
    }

    pub fn file_index(&self, group: SharingGroupId) -> Result<FileIndexResponse, SyncError> {
        self.call(&GetFileIndex { sharing_group_id: group })
    }

    pub fn master_version(&self, group: SharingGroupId) -> Result<u64, SyncError> {
        Ok(self.file_index(group)?.master_version)
    }

    /// Version 0 upload using the `AppendBytes` resolver.
    pub fn upload_new(
        &self,
        group: SharingGroupId,
        file_id: FileId,
        file_group_id: Option<FileGroupId>,
        content: &[u8],
    ) -> Result<UploadFileResponse, SyncError> {
        let master_version = self.master_version(group)?;
        self.call(&UploadFile {
            sharing_group_id: group,
            file_id,
            file_group_id,
            mime_type: "text/plain".into(),
            app_meta_data: None,
            file_version: 0,
            change_resolver_name: Some("AppendBytes".into()),
            master_version,
            content: content.to_vec(),
        })
    }

    pub fn upload_change(
        &self,
        group: SharingGroupId,
        file_id: FileId,
        file_version: u32,
        change: &[u8],
    ) -> Result<UploadFileResponse, SyncError> {
        let master_version = self.master_version(group)?;
        self.call(&UploadFile {
            sharing_group_id: group,
            file_id,
            file_group_id: None,
            mime_type: "text/plain".into(),
            app_meta_data: None,
            file_version,
            change_resolver_name: None,
            master_version,
            content: change.to_vec(),
        })
    }

    pub fn upload_deletion(&self, group: SharingGroupId, file_id: FileId) -> Result<UploadDeletionResponse, SyncError> {
        let master_version = self.master_version(group)?;
        self.call(&UploadDeletion {
            sharing_group_id: group,
            file_id: Some(file_id),
            file_group_id: None,
            master_version,
        })
    }

    /// Deletion of every file in `file_group_id`.
    pub fn upload_group_deletion(
        &self,
        group: SharingGroupId,
        file_group_id: FileGroupId,
    ) -> Result<UploadDeletionResponse, SyncError> {
        let master_version = self.master_version(group)?;
        self.call(&UploadDeletion {
            sharing_group_id: group,
            file_id: None,
            file_group_id: Some(file_group_id),
            master_version,
        })
    }

    pub fn done_uploads(&self, group: SharingGroupId) -> Result<DoneUploadsResponse, SyncError> {
        let master_version = self.master_version(group)?;
        self.call(&DoneUploads {
            sharing_group_id: group,
            master_version,
        })
    }
}
