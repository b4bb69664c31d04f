use serde_json::json;

use crate::common::TestCluster;

#[tokio::test]
async fn test_setup_issues_root_token_once() {
    let cluster = TestCluster::new(&["a.example.com"]).await;
    let res = cluster
        .setup("a.example.com", json!({ "nodes": ["a.example.com"] }))
        .await;

    assert_eq!(res.result, "success");
    assert_eq!(res.root_token.value.len(), 68);
    assert!(res.root_token.value.starts_with("mrt."));

    let node = cluster.node("a.example.com");
    let local = node.local().await.unwrap();
    assert_eq!(local.serial, 1);
    assert_eq!(local.cluster, res.uuids.cluster);
    assert!(node.elector().is_leading());

    let err = node
        .setup(json!({ "nodes": ["a.example.com"] }), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "morio.core.ephemeral.required");
    assert_eq!(err.status().as_u16(), 409);
}

#[tokio::test]
async fn test_setup_rejects_settings_without_local_fqdn() {
    let cluster = TestCluster::new(&["a.example.com"]).await;
    let node = cluster.node("a.example.com");

    let err = node
        .setup(json!({ "nodes": ["b.example.com"] }), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "morio.core.settings.fqdn.mismatch");
    assert!(node.is_ephemeral().await);

    let err = node.setup(json!({ "nodes": [] }), None).await.unwrap_err();
    assert_eq!(err.code(), "morio.core.settings.invalid");
}

#[tokio::test]
async fn test_single_node_status_is_green() {
    let cluster = TestCluster::new(&["a.example.com"]).await;
    cluster
        .setup("a.example.com", json!({ "nodes": ["a.example.com"] }))
        .await;
    cluster.round().await;

    let status = cluster.node("a.example.com").status().await;
    assert_eq!(status.status.cluster.code, 0, "{}", status.status.cluster.msg);
    assert_eq!(status.status.cluster.leading, Some(true));
    assert!(status.node.config_resolved);
    assert_eq!(status.nodes.len(), 1);
}
