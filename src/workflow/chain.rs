use crate::error::BastionError;
use crate::model::{ApprovalLevel, ApproverSlot, FoldedName, LevelStatus, ServerScope};
use crate::store::HostDirectory;

/// Approver identities per level, in level order, before the requester is
/// filtered out.
pub(crate) async fn resolve_approvers(
    hosts: &dyn HostDirectory,
    scope: &ServerScope,
) -> Result<Vec<Vec<FoldedName>>, BastionError> {
    match scope {
        ServerScope::Group(id) => {
            let group = hosts.server_group(id).await?;
            let mut levels = Vec::with_capacity(group.approver_levels.len());
            for directory_groups in &group.approver_levels {
                let mut members = Vec::new();
                for name in directory_groups {
                    members.extend(hosts.approver_group_members(name).await?);
                }
                levels.push(members);
            }
            Ok(levels)
        }
        ServerScope::Hosts(names) => {
            let mut members = Vec::new();
            for name in names {
                let Some(host) = hosts.host(name).await? else {
                    tracing::warn!(host = %name, "requested host has no inventory record");
                    continue;
                };
                if let Some(group) = host.iam_group.as_deref() {
                    members.extend(hosts.approver_group_members(group).await?);
                }
            }
            Ok(vec![members])
        }
    }
}

/// Build ordered approval levels. The requester never approves their own
/// request; level 1 opens immediately.
pub(crate) fn build_levels(
    resolved: Vec<Vec<FoldedName>>,
    requester: &FoldedName,
) -> Result<Vec<ApprovalLevel>, BastionError> {
    if resolved.is_empty() {
        return Err(BastionError::validation(
            "approvers",
            "no approval levels are configured for this scope",
        ));
    }
    let mut levels = Vec::with_capacity(resolved.len());
    for (i, members) in resolved.into_iter().enumerate() {
        let mut approvers: Vec<ApproverSlot> = Vec::new();
        for member in members {
            if &member == requester || member.is_empty() {
                continue;
            }
            if approvers.iter().all(|s| s.identity != member) {
                approvers.push(ApproverSlot::new(member));
            }
        }
        if approvers.is_empty() {
            return Err(BastionError::validation(
                "approvers",
                format!("approval level {} has no eligible approvers", i + 1),
            ));
        }
        levels.push(ApprovalLevel {
            approvers,
            status: if i == 0 {
                LevelStatus::ReadyToApprove
            } else {
                LevelStatus::Pending
            },
        });
    }
    Ok(levels)
}
