//! Minimal kubeconfig documents for talking to a test API server.
//!
//! Documents are written as JSON, which every kubeconfig (YAML) reader
//! accepts.

use kube_client::config::{
    AuthInfo, Cluster, Context, KubeConfigOptions, Kubeconfig, NamedAuthInfo, NamedCluster,
    NamedContext,
};
use url::Url;

use crate::error::Result;
use crate::process::arguments::url_string;

pub const CLUSTER_NAME: &str = "envtest";
pub const CONTEXT_NAME: &str = "envtest";
const ANONYMOUS_USER: &str = "envtest-anonymous";

/// Who the client acts as. The API server's insecure port trusts every
/// request, so identities are applied through impersonation headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity<'a> {
    pub name: &'a str,
    pub groups: &'a [String],
}

/// A kubeconfig for `server`, acting as `identity` when given.
pub fn build(server: &Url, identity: Option<&Identity<'_>>) -> Kubeconfig {
    let user_name = identity.map_or(ANONYMOUS_USER, |identity| identity.name);
    let auth_info = match identity {
        Some(identity) => AuthInfo {
            impersonate: Some(identity.name.to_string()),
            impersonate_groups: (!identity.groups.is_empty()).then(|| identity.groups.to_vec()),
            ..Default::default()
        },
        None => AuthInfo::default(),
    };

    Kubeconfig {
        api_version: Some("v1".into()),
        kind: Some("Config".into()),
        clusters: vec![NamedCluster {
            name: CLUSTER_NAME.into(),
            cluster: Some(Cluster {
                server: Some(url_string(server)),
                ..Default::default()
            }),
        }],
        auth_infos: vec![NamedAuthInfo {
            name: user_name.into(),
            auth_info: Some(auth_info),
        }],
        contexts: vec![NamedContext {
            name: CONTEXT_NAME.into(),
            context: Some(Context {
                cluster: CLUSTER_NAME.into(),
                user: user_name.into(),
                ..Default::default()
            }),
        }],
        current_context: Some(CONTEXT_NAME.into()),
        ..Default::default()
    }
}

/// Serializes `kubeconfig` as a JSON document.
pub fn render(kubeconfig: &Kubeconfig) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(kubeconfig)?)
}

/// Builds a client configuration from `kubeconfig`'s current context.
pub async fn client_config(kubeconfig: Kubeconfig) -> Result<kube_client::Config> {
    let config =
        kube_client::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn impersonates_the_identity() {
        let groups = vec!["system:masters".to_string()];
        let identity = Identity {
            name: "envtest-admin",
            groups: &groups,
        };
        let server = Url::parse("http://127.0.0.1:8080").unwrap();

        let rendered = render(&build(&server, Some(&identity))).unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&rendered).unwrap();

        assert_eq!(doc["apiVersion"], "v1");
        assert_eq!(doc["current-context"], CONTEXT_NAME);
        assert_eq!(doc["clusters"][0]["cluster"]["server"], "http://127.0.0.1:8080");
        assert_eq!(doc["users"][0]["name"], "envtest-admin");
        assert_eq!(doc["users"][0]["user"]["as"], "envtest-admin");
        assert_eq!(doc["users"][0]["user"]["as-groups"][0], "system:masters");
        assert_eq!(doc["contexts"][0]["context"]["user"], "envtest-admin");
    }

    #[test]
    fn anonymous_has_no_impersonation() {
        let server = Url::parse("http://127.0.0.1:8080").unwrap();
        let rendered = render(&build(&server, None)).unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&rendered).unwrap();

        assert_eq!(doc["users"][0]["name"], ANONYMOUS_USER);
        assert_eq!(doc["users"][0]["user"], serde_json::json!({}));
    }

    #[test]
    fn rendered_documents_read_back() {
        let server = Url::parse("http://127.0.0.1:8080").unwrap();
        let rendered = render(&build(&server, None)).unwrap();

        let text = std::str::from_utf8(&rendered).unwrap();
        let parsed = Kubeconfig::from_yaml(text).unwrap();

        assert_eq!(parsed.current_context.as_deref(), Some(CONTEXT_NAME));
        assert_eq!(parsed.clusters[0].name, CLUSTER_NAME);
        assert_eq!(
            parsed.clusters[0].cluster.as_ref().and_then(|c| c.server.as_deref()),
            Some("http://127.0.0.1:8080")
        );
    }

    #[tokio::test]
    async fn client_config_points_at_the_server() {
        let groups = vec!["system:masters".to_string()];
        let identity = Identity {
            name: "envtest-admin",
            groups: &groups,
        };
        let server = Url::parse("http://127.0.0.1:8080").unwrap();

        let config = client_config(build(&server, Some(&identity))).await.unwrap();

        assert_eq!(config.cluster_url.scheme_str(), Some("http"));
        assert_eq!(config.cluster_url.host(), Some("127.0.0.1"));
        assert_eq!(config.cluster_url.port_u16(), Some(8080));
    }
}
