// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tool policy resolution (4.5.1): ask the remote control-plane client for
//! a device's allow/deny tool lists, reconcile them, and fail soft — a
//! broken or unreachable policy source disables tool filtering rather
//! than blocking the turn.

use std::sync::Arc;

use crate::orchestrator::external::ControlPlaneClient;

#[derive(Debug, Clone, Default)]
pub struct ResolvedToolPolicy {
    pub allow_tools: Option<Vec<String>>,
    pub deny_tools: Option<Vec<String>>,
    pub warning: Option<String>,
}

pub async fn resolve_tool_policy(
    client: Option<&Arc<dyn ControlPlaneClient>>,
    device_id: &str,
) -> ResolvedToolPolicy {
    let Some(client) = client else {
        return ResolvedToolPolicy::default();
    };

    match client.fetch_device_policy(device_id).await {
        Ok(policy) => {
            let deny = policy.deny_tools;
            let allow: Vec<String> =
                policy.allow_tools.into_iter().filter(|t| !deny.contains(t)).collect();
            ResolvedToolPolicy {
                allow_tools: if allow.is_empty() { None } else { Some(allow) },
                deny_tools: if deny.is_empty() { None } else { Some(deny) },
                warning: None,
            }
        }
        Err(e) => ResolvedToolPolicy {
            allow_tools: None,
            deny_tools: None,
            warning: Some(format!("tool policy unavailable: {e}")),
        },
    }
}

#[cfg(test)]
mod tool_policy_tests {
    use super::*;
    use crate::orchestrator::external::DevicePolicy;
    use async_trait::async_trait;

    struct FixedClient(anyhow::Result<DevicePolicy>);

    #[async_trait]
    impl ControlPlaneClient for FixedClient {
        async fn fetch_device_policy(&self, _device_id: &str) -> anyhow::Result<DevicePolicy> {
            match &self.0 {
                Ok(p) => Ok(p.clone()),
                Err(_) => anyhow::bail!("unreachable"),
            }
        }
    }

    #[tokio::test]
    async fn no_client_means_unenforced() {
        let resolved = resolve_tool_policy(None, "d1").await;
        assert!(resolved.allow_tools.is_none());
        assert!(resolved.warning.is_none());
    }

    #[tokio::test]
    async fn deny_list_subtracted_from_allow_list() {
        let client: Arc<dyn ControlPlaneClient> = Arc::new(FixedClient(Ok(DevicePolicy {
            allow_tools: vec!["search".into(), "camera".into()],
            deny_tools: vec!["camera".into()],
        })));
        let resolved = resolve_tool_policy(Some(&client), "d1").await;
        assert_eq!(resolved.allow_tools, Some(vec!["search".to_owned()]));
    }

    #[tokio::test]
    async fn failure_disables_enforcement_and_warns() {
        let client: Arc<dyn ControlPlaneClient> =
            Arc::new(FixedClient(Err(anyhow::anyhow!("down"))));
        let resolved = resolve_tool_policy(Some(&client), "d1").await;
        assert!(resolved.allow_tools.is_none());
        assert!(resolved.warning.is_some());
    }
}
