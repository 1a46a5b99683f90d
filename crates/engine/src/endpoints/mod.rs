mod accounts;
mod catalog;
mod sharing;
mod uploads;

pub use accounts::{AddUser, AddUserResponse, RemoveUser, RemoveUserResponse};
pub use catalog::{DownloadFile, DownloadFileResponse, FileIndexResponse, GetFileIndex};
pub use sharing::{
    CreateSharingGroup, CreateSharingGroupResponse, CreateSharingInvitation, CreateSharingInvitationResponse,
    RedeemSharingInvitation, RedeemSharingInvitationResponse,
};
pub use uploads::{
    DoneUploads, DoneUploadsResponse, GetUploads, GetUploadsResponse, GetUploadsResults, GetUploadsResultsResponse,
    UploadDeletion, UploadDeletionResponse, UploadFile, UploadFileResponse,
};
