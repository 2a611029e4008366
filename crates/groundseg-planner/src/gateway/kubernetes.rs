// Copyright (C) 2025 The groundseg Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kubernetes gateway.
//!
//! Every job step attempt becomes one `batch/v1` Job with a single pod that
//! is never restarted; retries are decided by the planner, not by the
//! cluster.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job as K8sJob, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, HostPathVolumeSource, Pod, PodSpec, PodTemplateSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, Config};
use tracing::{debug, info, warn};

use super::*;
use crate::facility::VolumeConfig;

const MANAGED_BY: &str = "groundseg-planner";

/// Gateway to one Kubernetes namespace.
pub struct KubernetesGateway {
    facility: String,
    namespace: String,
    client: Client,
    volumes: Vec<VolumeConfig>,
}

impl KubernetesGateway {
    /// Build a client from a kubeconfig file, or infer it from the
    /// environment when no path is given.
    pub async fn connect_to(
        facility: impl Into<String>,
        kubeconfig_path: Option<&Path>,
        context: Option<&str>,
        namespace: impl Into<String>,
        volumes: Vec<VolumeConfig>,
    ) -> Result<Self> {
        let config = match kubeconfig_path {
            Some(path) => {
                let kubeconfig = kube::config::Kubeconfig::read_from(path).map_err(|e| {
                    GatewayError::Configuration(format!(
                        "Failed to read kubeconfig from {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                let options = kube::config::KubeConfigOptions {
                    context: context.map(str::to_string),
                    cluster: None,
                    user: None,
                };
                Config::from_custom_kubeconfig(kubeconfig, &options)
                    .await
                    .map_err(|e| {
                        GatewayError::Configuration(format!(
                            "Failed to create Kubernetes config: {}",
                            e
                        ))
                    })?
            }
            None => Config::infer().await.map_err(|e| {
                GatewayError::Configuration(format!("Failed to infer Kubernetes config: {}", e))
            })?,
        };

        let client = Client::try_from(config).map_err(|e| {
            GatewayError::Configuration(format!("Failed to create Kubernetes client: {}", e))
        })?;

        Ok(Self {
            facility: facility.into(),
            namespace: namespace.into(),
            client,
            volumes,
        })
    }

    fn jobs(&self) -> Api<K8sJob> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

/// Map a client error. Server-side and transport failures are transient.
fn classify(err: kube::Error) -> GatewayError {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => GatewayError::NotFound(ae.message),
        kube::Error::Api(ae) if ae.code >= 500 || ae.code == 429 => {
            GatewayError::Unreachable(format!("{} ({})", ae.message, ae.code))
        }
        kube::Error::Api(ae) => GatewayError::Rejected(format!("{} ({})", ae.message, ae.code)),
        other => GatewayError::Unreachable(other.to_string()),
    }
}

/// Job manifest for one execution unit.
pub fn job_manifest(request: &SubmitRequest, volumes: &[VolumeConfig]) -> K8sJob {
    let labels = BTreeMap::from([
        ("app.kubernetes.io/managed-by".to_string(), MANAGED_BY.to_string()),
        ("groundseg/job-step".to_string(), request.job_step_id.clone()),
        ("groundseg/attempt".to_string(), request.attempt.to_string()),
    ]);

    let env = request
        .env
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect();

    let container = Container {
        name: "processor".to_string(),
        image: Some(request.image.clone()),
        command: (!request.command.is_empty()).then(|| request.command.clone()),
        args: Some(vec![request.joborder_location.clone()]),
        env: Some(env),
        volume_mounts: (!volumes.is_empty()).then(|| {
            volumes
                .iter()
                .map(|v| VolumeMount {
                    name: v.name.clone(),
                    mount_path: v.mount_path.clone(),
                    ..Default::default()
                })
                .collect()
        }),
        ..Default::default()
    };

    K8sJob {
        metadata: ObjectMeta {
            name: Some(request.unit_name.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    restart_policy: Some("Never".to_string()),
                    volumes: (!volumes.is_empty()).then(|| {
                        volumes
                            .iter()
                            .map(|v| Volume {
                                name: v.name.clone(),
                                host_path: Some(HostPathVolumeSource {
                                    path: v.host_path.clone(),
                                    ..Default::default()
                                }),
                                ..Default::default()
                            })
                            .collect()
                    }),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Derive the unit status from the Job object and its pods.
pub fn job_status(job: &K8sJob, pods: &[Pod]) -> ExecutionStatus {
    let Some(status) = job.status.as_ref() else {
        return ExecutionStatus::Pending;
    };

    if status.succeeded.unwrap_or(0) > 0 {
        return ExecutionStatus::Succeeded;
    }

    let failed_condition = status.conditions.as_ref().and_then(|conditions| {
        conditions
            .iter()
            .find(|c| c.type_ == "Failed" && c.status == "True")
    });

    if status.failed.unwrap_or(0) > 0 || failed_condition.is_some() {
        let reason = termination_reason(pods)
            .or_else(|| failed_condition.and_then(|c| c.message.clone().or(c.reason.clone())))
            .unwrap_or_else(|| "execution unit failed".to_string());
        return ExecutionStatus::Failed { reason };
    }

    if status.active.unwrap_or(0) > 0 {
        ExecutionStatus::Running
    } else {
        ExecutionStatus::Pending
    }
}

/// Exit reason of the first terminated container with a non-zero exit.
fn termination_reason(pods: &[Pod]) -> Option<String> {
    pods.iter()
        .filter_map(|pod| pod.status.as_ref()?.container_statuses.as_ref())
        .flatten()
        .filter_map(|cs| cs.state.as_ref()?.terminated.as_ref())
        .find(|t| t.exit_code != 0 || t.signal.is_some())
        .map(|t| {
            let base = match t.signal {
                Some(signal) => format!("signal {}", signal),
                None if t.exit_code > 128 => format!("signal {}", t.exit_code - 128),
                None => format!("exit code {}", t.exit_code),
            };
            match &t.reason {
                Some(reason) if reason != "Error" => format!("{} ({})", base, reason),
                _ => base,
            }
        })
}

#[async_trait]
impl ClusterGateway for KubernetesGateway {
    fn facility(&self) -> &str {
        &self.facility
    }

    fn gateway_type(&self) -> &'static str {
        "kubernetes"
    }

    async fn connect(&self) -> Result<GatewayHealth> {
        match self.jobs().list(&ListParams::default().limit(1)).await {
            Ok(_) => Ok(GatewayHealth::Healthy),
            Err(kube::Error::Api(ae)) if ae.code == 403 => Ok(GatewayHealth::Degraded {
                reason: format!("Insufficient permissions in namespace {}", self.namespace),
            }),
            Err(e) => Err(classify(e)),
        }
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<ExecutionHandle> {
        let manifest = job_manifest(request, &self.volumes);

        match self.jobs().create(&PostParams::default(), &manifest).await {
            Ok(_) => {
                info!(
                    facility = %self.facility,
                    unit = %request.unit_name,
                    job_step_id = %request.job_step_id,
                    "Execution unit created"
                );
                Ok(request.unit_name.clone())
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(
                    facility = %self.facility,
                    unit = %request.unit_name,
                    "Execution unit already exists"
                );
                Ok(request.unit_name.clone())
            }
            Err(e) => Err(classify(e)),
        }
    }

    async fn poll(&self, handle: &str) -> Result<ExecutionStatus> {
        let job = self
            .jobs()
            .get_opt(handle)
            .await
            .map_err(classify)?
            .ok_or_else(|| GatewayError::NotFound(handle.to_string()))?;

        let status = job_status(&job, &[]);
        if !matches!(status, ExecutionStatus::Failed { .. }) {
            return Ok(status);
        }

        let pods = self
            .pods()
            .list(&ListParams::default().labels(&format!("job-name={}", handle)))
            .await
            .map_err(classify)?;
        Ok(job_status(&job, &pods.items))
    }

    async fn dispose(&self, handle: &str) -> Result<()> {
        match self.jobs().delete(handle, &DeleteParams::background()).await {
            Ok(_) => {
                debug!(facility = %self.facility, unit = %handle, "Execution unit deleted");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(facility = %self.facility, unit = %handle, "Execution unit already deleted");
                Ok(())
            }
            Err(e) => {
                warn!(facility = %self.facility, unit = %handle, error = %e, "Failed to delete execution unit");
                Err(classify(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::batch::v1::{JobCondition, JobStatus};
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateTerminated, ContainerStatus, PodStatus,
    };

    fn request() -> SubmitRequest {
        SubmitRequest {
            job_step_id: "js-1".to_string(),
            attempt: 2,
            unit_name: "gs-js-1-2".to_string(),
            image: "registry.local/l2:2.1".to_string(),
            command: vec!["/usr/bin/run".to_string()],
            joborder_location: "/data/f1/joborders/js-1.xml".to_string(),
            env: BTreeMap::from([
                ("FS_TYPE".to_string(), "POSIX".to_string()),
                ("JOBORDER_FILE".to_string(), "/data/f1/joborders/js-1.xml".to_string()),
            ]),
        }
    }

    fn job_with(status: JobStatus) -> K8sJob {
        K8sJob {
            status: Some(status),
            ..Default::default()
        }
    }

    fn terminated_pod(exit_code: i32, signal: Option<i32>, reason: Option<&str>) -> Pod {
        Pod {
            status: Some(PodStatus {
                container_statuses: Some(vec![ContainerStatus {
                    name: "processor".to_string(),
                    state: Some(ContainerState {
                        terminated: Some(ContainerStateTerminated {
                            exit_code,
                            signal,
                            reason: reason.map(str::to_string),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_manifest_runs_once_with_env() {
        let volumes = vec![VolumeConfig {
            name: "storage".to_string(),
            host_path: "/srv/groundseg".to_string(),
            mount_path: "/data".to_string(),
        }];
        let job = job_manifest(&request(), &volumes);

        assert_eq!(job.metadata.name.as_deref(), Some("gs-js-1-2"));
        let spec = job.spec.unwrap();
        assert_eq!(spec.backoff_limit, Some(0));

        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        assert_eq!(pod.volumes.unwrap()[0].host_path.as_ref().unwrap().path, "/srv/groundseg");

        let container = &pod.containers[0];
        assert_eq!(container.args.as_ref().unwrap(), &vec!["/data/f1/joborders/js-1.xml".to_string()]);
        let env = container.env.as_ref().unwrap();
        assert!(env.iter().any(|e| e.name == "FS_TYPE" && e.value.as_deref() == Some("POSIX")));
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(job_status(&K8sJob::default(), &[]), ExecutionStatus::Pending);
        assert_eq!(
            job_status(
                &job_with(JobStatus {
                    active: Some(1),
                    ..Default::default()
                }),
                &[]
            ),
            ExecutionStatus::Running
        );
        assert_eq!(
            job_status(
                &job_with(JobStatus {
                    succeeded: Some(1),
                    ..Default::default()
                }),
                &[]
            ),
            ExecutionStatus::Succeeded
        );
    }

    #[test]
    fn test_failure_reason_from_pod() {
        let failed = job_with(JobStatus {
            failed: Some(1),
            ..Default::default()
        });

        let status = job_status(&failed, &[terminated_pod(137, None, Some("OOMKilled"))]);
        assert_eq!(
            status,
            ExecutionStatus::Failed {
                reason: "signal 9 (OOMKilled)".to_string()
            }
        );

        let status = job_status(&failed, &[terminated_pod(0, Some(9), Some("Error"))]);
        assert_eq!(
            status,
            ExecutionStatus::Failed {
                reason: "signal 9".to_string()
            }
        );

        let status = job_status(&failed, &[terminated_pod(2, None, None)]);
        assert_eq!(
            status,
            ExecutionStatus::Failed {
                reason: "exit code 2".to_string()
            }
        );
    }

    #[test]
    fn test_failure_reason_from_condition() {
        let job = job_with(JobStatus {
            conditions: Some(vec![JobCondition {
                type_: "Failed".to_string(),
                status: "True".to_string(),
                reason: Some("DeadlineExceeded".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert_eq!(
            job_status(&job, &[]),
            ExecutionStatus::Failed {
                reason: "DeadlineExceeded".to_string()
            }
        );
    }
}
