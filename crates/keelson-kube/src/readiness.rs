//! Readiness rules for live objects
//!
//! Evaluated on every tracker poll. Well-known workload kinds are inspected through
//! their `k8s-openapi` types; any other kind counts as ready as soon as it exists.

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Namespace, PersistentVolumeClaim, Pod};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::DynamicObject;
use serde::de::DeserializeOwned;

/// Result of one readiness evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// Not ready yet, with what is being waited for
    Pending(String),
    /// Will never become ready
    Failed(String),
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }
}

/// Evaluate readiness of a live object
pub fn evaluate(object: &DynamicObject) -> Readiness {
    let kind = object
        .types
        .as_ref()
        .map(|t| t.kind.as_str())
        .unwrap_or_default();

    match kind {
        "Deployment" => typed(object, deployment),
        "StatefulSet" => typed(object, statefulset),
        "DaemonSet" => typed(object, daemonset),
        "ReplicaSet" => typed(object, replicaset),
        "Job" => typed(object, job),
        "Pod" => typed(object, pod),
        "PersistentVolumeClaim" => typed(object, pvc),
        "Namespace" => typed(object, namespace),
        "CustomResourceDefinition" => typed(object, crd),
        _ => Readiness::Ready,
    }
}

fn typed<K: DeserializeOwned>(object: &DynamicObject, check: fn(&K) -> Readiness) -> Readiness {
    match serde_json::to_value(object).and_then(serde_json::from_value::<K>) {
        Ok(k) => check(&k),
        Err(e) => Readiness::Failed(format!("cannot decode object: {}", e)),
    }
}

fn generation_observed(generation: Option<i64>, observed: Option<i64>) -> bool {
    match (generation, observed) {
        (Some(g), Some(o)) => o >= g,
        (Some(_), None) => false,
        (None, _) => true,
    }
}

/// A Deployment is ready when all replicas are updated, ready and available
fn deployment(d: &Deployment) -> Readiness {
    let status = d.status.as_ref();
    if !generation_observed(
        d.metadata.generation,
        status.and_then(|s| s.observed_generation),
    ) {
        return Readiness::Pending("waiting for rollout to be observed".to_string());
    }

    if let Some(cond) = status
        .and_then(|s| s.conditions.as_ref())
        .and_then(|c| c.iter().find(|c| c.type_ == "Progressing"))
        && cond.status == "False"
        && cond.reason.as_deref() == Some("ProgressDeadlineExceeded")
    {
        return Readiness::Failed(
            cond.message
                .clone()
                .unwrap_or_else(|| "progress deadline exceeded".to_string()),
        );
    }

    let desired = d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let ready = status.and_then(|s| s.ready_replicas).unwrap_or(0);
    let updated = status.and_then(|s| s.updated_replicas).unwrap_or(0);
    let available = status.and_then(|s| s.available_replicas).unwrap_or(0);

    if ready == desired && updated == desired && available == desired {
        Readiness::Ready
    } else {
        Readiness::Pending(format!(
            "{}/{} ready, {}/{} updated, {}/{} available",
            ready, desired, updated, desired, available, desired
        ))
    }
}

/// Rollout complete and all replicas ready
fn statefulset(s: &StatefulSet) -> Readiness {
    let status = s.status.as_ref();
    if !generation_observed(
        s.metadata.generation,
        status.and_then(|s| s.observed_generation),
    ) {
        return Readiness::Pending("waiting for rollout to be observed".to_string());
    }

    let desired = s.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let ready = status.and_then(|s| s.ready_replicas).unwrap_or(0);
    let updated = status.and_then(|s| s.updated_replicas).unwrap_or(0);
    let revision_match = status.and_then(|s| s.current_revision.as_ref())
        == status.and_then(|s| s.update_revision.as_ref());

    if ready == desired && updated == desired && revision_match {
        Readiness::Ready
    } else {
        Readiness::Pending(format!(
            "{}/{} ready, {}/{} updated, revision match: {}",
            ready, desired, updated, desired, revision_match
        ))
    }
}

fn daemonset(d: &DaemonSet) -> Readiness {
    let status = d.status.as_ref();
    if !generation_observed(
        d.metadata.generation,
        status.and_then(|s| s.observed_generation),
    ) {
        return Readiness::Pending("waiting for rollout to be observed".to_string());
    }

    let desired = status.map(|s| s.desired_number_scheduled).unwrap_or(0);
    let ready = status.map(|s| s.number_ready).unwrap_or(0);
    let updated = status.and_then(|s| s.updated_number_scheduled).unwrap_or(0);

    if ready == desired && updated == desired {
        Readiness::Ready
    } else {
        Readiness::Pending(format!(
            "{}/{} ready, {}/{} updated",
            ready, desired, updated, desired
        ))
    }
}

fn replicaset(r: &ReplicaSet) -> Readiness {
    let desired = r.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let ready = r.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0);
    if ready >= desired {
        Readiness::Ready
    } else {
        Readiness::Pending(format!("{}/{} ready", ready, desired))
    }
}

/// A Job is ready once it completed; a Failed condition is permanent
fn job(j: &Job) -> Readiness {
    let status = j.status.as_ref();
    let conditions = status.and_then(|s| s.conditions.as_ref());

    if let Some(cond) = conditions
        .and_then(|c| c.iter().find(|c| c.type_ == "Failed" && c.status == "True"))
    {
        return Readiness::Failed(
            cond.message
                .clone()
                .unwrap_or_else(|| "job failed".to_string()),
        );
    }

    let complete = conditions
        .map(|c| c.iter().any(|c| c.type_ == "Complete" && c.status == "True"))
        .unwrap_or(false);
    let succeeded = status.and_then(|s| s.succeeded).unwrap_or(0);

    if complete || succeeded > 0 {
        Readiness::Ready
    } else {
        Readiness::Pending(format!(
            "running: {} active, {} failed",
            status.and_then(|s| s.active).unwrap_or(0),
            status.and_then(|s| s.failed).unwrap_or(0)
        ))
    }
}

fn pod(p: &Pod) -> Readiness {
    let status = p.status.as_ref();
    match status.and_then(|s| s.phase.as_deref()) {
        Some("Succeeded") => return Readiness::Ready,
        Some("Failed") => {
            return Readiness::Failed(
                status
                    .and_then(|s| s.message.clone())
                    .unwrap_or_else(|| "pod failed".to_string()),
            );
        }
        _ => {}
    }

    let ready = status
        .and_then(|s| s.conditions.as_ref())
        .map(|c| c.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
        .unwrap_or(false);
    if ready {
        Readiness::Ready
    } else {
        Readiness::Pending("pod not ready".to_string())
    }
}

fn pvc(p: &PersistentVolumeClaim) -> Readiness {
    match p.status.as_ref().and_then(|s| s.phase.as_deref()) {
        Some("Bound") => Readiness::Ready,
        Some("Lost") => Readiness::Failed("claim lost its volume".to_string()),
        phase => Readiness::Pending(format!("phase {}", phase.unwrap_or("unknown"))),
    }
}

fn namespace(n: &Namespace) -> Readiness {
    match n.status.as_ref().and_then(|s| s.phase.as_deref()) {
        Some("Terminating") => Readiness::Pending("namespace is terminating".to_string()),
        _ => Readiness::Ready,
    }
}

fn crd(c: &CustomResourceDefinition) -> Readiness {
    let established = c
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Established" && c.status == "True")
        })
        .unwrap_or(false);
    if established {
        Readiness::Ready
    } else {
        Readiness::Pending("CRD not established".to_string())
    }
}
