//! Compute Engine REST wire types.

use serde::{Deserialize, Serialize};

use crate::ports::{OperationFault, OperationStatus};

/// A zonal operation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub target_link: Option<String>,
    #[serde(default)]
    pub error: Option<OperationErrors>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OperationErrors {
    #[serde(default)]
    pub errors: Vec<OperationErrorItem>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OperationErrorItem {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

impl From<Operation> for OperationStatus {
    fn from(op: Operation) -> Self {
        // An error block wins over the status string.
        if let Some(errors) = op.error {
            return OperationStatus::Failed {
                faults: errors
                    .errors
                    .into_iter()
                    .map(|e| OperationFault {
                        code: e.code,
                        message: e.message,
                    })
                    .collect(),
            };
        }

        if op.status == "DONE" {
            OperationStatus::Done
        } else {
            OperationStatus::Pending { state: op.status }
        }
    }
}

/// Page of `instanceGroups.listInstances`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceGroupsListInstances {
    #[serde(default)]
    pub items: Vec<InstanceWithNamedPorts>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstanceWithNamedPorts {
    #[serde(default)]
    pub instance: String,
    #[serde(default)]
    pub status: String,
}

impl InstanceWithNamedPorts {
    /// Provisioning and running instances count toward capacity.
    pub fn is_live(&self) -> bool {
        matches!(self.status.as_str(), "PROVISIONING" | "RUNNING")
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListInstancesRequest {
    pub instance_state: &'static str,
}

#[derive(Debug, Serialize)]
pub struct InsertInstanceRequest {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct AddInstancesRequest {
    pub instances: Vec<InstanceReference>,
}

#[derive(Debug, Serialize)]
pub struct InstanceReference {
    pub instance: String,
}
