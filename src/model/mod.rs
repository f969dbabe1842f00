pub mod grant;
pub mod ids;
pub mod names;
pub mod policy;
pub mod request;

pub use grant::{AccessGrant, CommandScope, ServerScope};
pub use ids::{DirectoryGroupId, GrantId, GroupId, RequestId, ServerGroupId, WindowId};
pub use names::FoldedName;
pub use policy::{
    ApproverGroup, Blacklist, CommandEntry, CommandPolicyGroup, DirectoryGroup, GlobalPolicyConfig,
    HostRecord, ServerExceptionWindow, ServerGroup, SubjectRecord,
};
pub use request::{
    ApprovalDecision, ApprovalLevel, ApproverAction, ApproverSlot, LevelStatus, Request,
    RequestStatus,
};
