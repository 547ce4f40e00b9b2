// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Scenario tests for appmesh-inject.
//!
//! These tests run without a Kubernetes cluster. ReplicaSet lookups are
//! served from memory.

#[path = "../common/fixtures.rs"]
mod fixtures;

use serde_json::Value;

use appmesh_inject::webhooks::{ReplicaSetLookup, resolve};
use appmesh_inject::{PodDescriptor, ServerConfig, generate_patch};

use fixtures::{PodBuilder, StaticReplicaSets, config};

const PORTS: &str = "appmesh.k8s.aws/ports";
const VIRTUAL_NODE: &str = "appmesh.k8s.aws/virtualNode";

/// Resolve and render the patch for a pod in namespace `test`
async fn patch_for(
    config: &ServerConfig,
    pod: PodBuilder,
    lookup: &dyn ReplicaSetLookup,
) -> appmesh_inject::Result<Vec<Value>> {
    let pod = PodDescriptor::from_pod(&pod.build(), Some("test"));
    let meta = resolve(config, &pod, lookup).await?;
    let bytes = generate_patch(&meta)?;
    let patch: Value = serde_json::from_slice(&bytes).unwrap();
    Ok(patch.as_array().unwrap().clone())
}

fn paths(ops: &[Value]) -> Vec<&str> {
    ops.iter().map(|op| op["path"].as_str().unwrap()).collect()
}

fn env(container: &Value, name: &str) -> Option<String> {
    container["env"]
        .as_array()?
        .iter()
        .find(|e| e["name"] == name)
        .and_then(|e| e["value"].as_str())
        .map(str::to_string)
}

fn annotated() -> PodBuilder {
    PodBuilder::new("podinfo-")
        .annotation(PORTS, "9898")
        .annotation(VIRTUAL_NODE, "podinfo")
        .annotation("appmesh.k8s.aws/egress_ignored_ports", "22")
}

mod scenario_tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_pod_gets_two_create_operations() {
        let ops = patch_for(&config(), annotated(), &StaticReplicaSets::default())
            .await
            .unwrap();

        assert_eq!(ops.len(), 2);
        assert_eq!(paths(&ops), vec!["/spec/initContainers", "/spec/containers"]);
        assert_eq!(ops[0]["value"].as_array().unwrap().len(), 1);

        let containers = ops[1]["value"].as_array().unwrap();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0]["image"], config().sidecar_image.as_str());
        assert_eq!(
            env(&containers[0], "APPMESH_VIRTUAL_NODE_NAME").as_deref(),
            Some("mesh/global/virtualNode/podinfo")
        );
    }

    #[tokio::test]
    async fn test_populated_pod_gets_two_append_operations() {
        let pod = annotated()
            .container("podinfo", &[])
            .init_container("migrate");
        let ops = patch_for(&config(), pod, &StaticReplicaSets::default())
            .await
            .unwrap();

        assert_eq!(ops.len(), 2);
        assert_eq!(
            paths(&ops),
            vec!["/spec/initContainers/-", "/spec/containers/-"]
        );
        assert_eq!(ops[1]["value"]["name"], "envoy");
    }

    #[tokio::test]
    async fn test_ports_from_single_container() {
        let pod = PodBuilder::new("podinfo-")
            .annotation(VIRTUAL_NODE, "podinfo")
            .container("podinfo", &[8080]);
        let ops = patch_for(&config(), pod, &StaticReplicaSets::default())
            .await
            .unwrap();

        assert_eq!(ops[0]["path"], "/spec/initContainers");
        let init = &ops[0]["value"][0];
        assert_eq!(env(init, "APPMESH_APP_PORTS").as_deref(), Some("8080"));
    }

    #[tokio::test]
    async fn test_pod_without_ports_is_skipped() {
        let pod = PodBuilder::new("podinfo-")
            .annotation(VIRTUAL_NODE, "podinfo")
            .container("podinfo", &[]);
        let err = patch_for(&config(), pod, &StaticReplicaSets::default())
            .await
            .unwrap_err();
        assert!(err.is_skip());
    }

    #[tokio::test]
    async fn test_virtual_node_from_deployment() {
        let lookup =
            StaticReplicaSets::default().with("test", "podinfo-7c45b75c87", "rs-uid", Some("podinfo"));
        let pod = PodBuilder::new("podinfo-7c45b75c87-")
            .annotation(PORTS, "9898")
            .owned_by("ReplicaSet", "podinfo-7c45b75c87", "rs-uid");
        let ops = patch_for(&config(), pod, &lookup).await.unwrap();

        let envoy = &ops[1]["value"][0];
        assert_eq!(
            env(envoy, "APPMESH_VIRTUAL_NODE_NAME").as_deref(),
            Some("mesh/global/virtualNode/podinfo-test")
        );
    }

    #[tokio::test]
    async fn test_missing_replica_set_skips_injection() {
        let pod = PodBuilder::new("podinfo-7c45b75c87-")
            .annotation(PORTS, "9898")
            .owned_by("ReplicaSet", "podinfo-7c45b75c87", "rs-uid");
        let err = patch_for(&config(), pod, &StaticReplicaSets::default())
            .await
            .unwrap_err();
        assert!(err.is_skip());
    }

    #[tokio::test]
    async fn test_stateful_set_owner_needs_no_lookup() {
        let pod = PodBuilder::new("db-")
            .annotation(PORTS, "5432")
            .owned_by("StatefulSet", "db", "sts-uid");
        let ops = patch_for(&config(), pod, &StaticReplicaSets::default())
            .await
            .unwrap();
        let envoy = &ops[1]["value"][0];
        assert_eq!(
            env(envoy, "APPMESH_VIRTUAL_NODE_NAME").as_deref(),
            Some("mesh/global/virtualNode/db-test")
        );
    }
}

mod feature_tests {
    use super::*;

    #[tokio::test]
    async fn test_jaeger_annotation_adds_volume_and_one_init_container() {
        let pod = annotated().annotation("appmesh.k8s.aws/tracing", "jaeger");
        let ops = patch_for(&config(), pod, &StaticReplicaSets::default())
            .await
            .unwrap();

        let volume_ops: Vec<_> = ops
            .iter()
            .filter(|op| op["path"].as_str().unwrap().starts_with("/spec/volumes"))
            .collect();
        assert_eq!(volume_ops.len(), 1);

        let init_ops: Vec<_> = ops
            .iter()
            .filter(|op| op["path"] == "/spec/initContainers/-")
            .collect();
        assert_eq!(init_ops.len(), 1);
        let script = init_ops[0]["value"]["command"][2].as_str().unwrap();
        assert!(script.contains("address: appmesh-jaeger.appmesh-system"));
        assert!(script.contains("port_value: 9411"));

        let text = serde_json::to_string(&ops).unwrap();
        assert!(!text.contains("datadog"));
        assert!(!text.contains("aws-xray-daemon"));
    }

    #[tokio::test]
    async fn test_xray_flag_adds_daemon() {
        let cfg = ServerConfig {
            inject_xray_sidecar: true,
            ..config()
        };
        let ops = patch_for(&cfg, annotated(), &StaticReplicaSets::default())
            .await
            .unwrap();
        let containers = ops[1]["value"].as_array().unwrap();
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[1]["name"], "xray-daemon");
        assert!(!paths(&ops).iter().any(|p| p.starts_with("/spec/volumes")));
    }

    #[tokio::test]
    async fn test_ecr_secret() {
        let cfg = ServerConfig {
            ecr_secret: true,
            ..config()
        };
        let ops = patch_for(&cfg, annotated(), &StaticReplicaSets::default())
            .await
            .unwrap();
        assert_eq!(ops[2]["path"], "/spec/imagePullSecrets");
        assert_eq!(ops[2]["value"][0]["name"], "appmesh-ecr-secret");

        let ops = patch_for(
            &cfg,
            annotated().image_pull_secret("regcred"),
            &StaticReplicaSets::default(),
        )
        .await
        .unwrap();
        assert_eq!(ops[2]["path"], "/spec/imagePullSecrets/-");
    }

    #[tokio::test]
    async fn test_fargate_pod_uses_cni_annotations() {
        let pod = annotated().label("eks.amazonaws.com/fargate-profile", "default");
        let ops = patch_for(&config(), pod, &StaticReplicaSets::default())
            .await
            .unwrap();

        assert_eq!(ops[0]["path"], "/metadata/annotations/appmesh.k8s.aws~1mesh");
        assert!(!paths(&ops).iter().any(|p| p.starts_with("/spec/initContainers")));
        assert!(paths(&ops).contains(&"/metadata/annotations/appmesh.k8s.aws~1egressIgnoredIPs"));
    }

    #[tokio::test]
    async fn test_iam_for_service_accounts() {
        let cfg = ServerConfig {
            enable_iam_for_service_accounts: true,
            ..config()
        };
        let ops = patch_for(&cfg, annotated(), &StaticReplicaSets::default())
            .await
            .unwrap();
        assert_eq!(ops.last().unwrap()["path"], "/spec/securityContext");
        assert_eq!(ops.last().unwrap()["value"]["fsGroup"], 1337);

        let ops = patch_for(&cfg, annotated().fs_group(2000), &StaticReplicaSets::default())
            .await
            .unwrap();
        assert!(!paths(&ops).iter().any(|p| p.contains("securityContext")));
    }
}

mod webhook_tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use appmesh_inject::health::AdmissionOutcome;
    use appmesh_inject::{HealthState, WebhookState, create_webhook_router};

    async fn review(state: Arc<WebhookState>, body: Value) -> Value {
        let response = create_webhook_router(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&body).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn state(lookup: StaticReplicaSets) -> Arc<WebhookState> {
        Arc::new(WebhookState::new(
            Arc::new(config()),
            Arc::new(lookup),
            Arc::new(HealthState::new()),
        ))
    }

    #[tokio::test]
    async fn test_deployment_pod_is_patched() {
        let lookup =
            StaticReplicaSets::default().with("test", "podinfo-7c45b75c87", "rs-uid", Some("podinfo"));
        let pod = PodBuilder::new("podinfo-7c45b75c87-")
            .container("podinfo", &[9898])
            .owned_by("ReplicaSet", "podinfo-7c45b75c87", "rs-uid")
            .build();

        let state = state(lookup);
        let body = fixtures::admission_review("8a4d5c3e", "test", &pod);
        let response = review(state.clone(), body).await;

        assert_eq!(response["response"]["uid"], "8a4d5c3e");
        assert_eq!(response["response"]["allowed"], true);
        assert_eq!(response["response"]["patchType"], "JSONPatch");
        assert_eq!(state.health.metrics.admissions(AdmissionOutcome::Patched), 1);
    }

    #[tokio::test]
    async fn test_disabled_pod_is_allowed_untouched() {
        let pod = annotated()
            .annotation("appmesh.k8s.aws/sidecarInjectorWebhook", "disabled")
            .container("podinfo", &[9898])
            .build();

        let state = state(StaticReplicaSets::default());
        let response = review(state.clone(), fixtures::admission_review("uid", "test", &pod)).await;

        assert_eq!(response["response"]["allowed"], true);
        assert!(response["response"].get("patch").is_none());
        assert_eq!(state.health.metrics.admissions(AdmissionOutcome::Skipped), 1);
    }

    #[tokio::test]
    async fn test_namespace_comes_from_request() {
        let lookup =
            StaticReplicaSets::default().with("shop", "web-5d4f", "rs-uid", Some("web"));
        let pod = PodBuilder::new("web-5d4f-")
            .namespace("ignored")
            .container("web", &[80])
            .owned_by("ReplicaSet", "web-5d4f", "rs-uid")
            .build();

        let state = state(lookup);
        let response = review(state, fixtures::admission_review("uid", "shop", &pod)).await;
        assert_eq!(response["response"]["patchType"], "JSONPatch");
    }
}
