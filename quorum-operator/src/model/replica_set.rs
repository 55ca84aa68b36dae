//! Rendering for the ensemble and the cluster.

use super::{Component, component_labels, selector_labels};
use crate::crd::{QuorumAssembly, ReplicaSetSpec, ResourceRequirements, StorageType};
use crate::error::{OperatorError, OperatorResult};
use crate::operator::ANNOTATION_DELETE_CLAIM;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, EnvVar,
    EnvVarSource, ObjectFieldSelector, PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec,
    PodTemplateSpec, Probe, ResourceRequirements as ContainerResources, SecretVolumeSource,
    Service, ServicePort, ServiceSpec, TCPSocketAction, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Ensemble client port.
pub const ENSEMBLE_CLIENT_PORT: i32 = 2181;
/// Ensemble peer (follower) port.
pub const ENSEMBLE_PEER_PORT: i32 = 2888;
/// Ensemble leader-election port.
pub const ENSEMBLE_ELECTION_PORT: i32 = 3888;
/// Cluster client port.
pub const CLUSTER_CLIENT_PORT: i32 = 9092;
/// Cluster replication port.
pub const CLUSTER_REPLICATION_PORT: i32 = 9091;
/// Metrics exporter port.
pub const METRICS_PORT: i32 = 9404;

/// Name of the data volume and its claim template.
pub const DATA_VOLUME: &str = "data";

const DATA_DIR: &str = "/var/lib/quorum/data";
const CONFIG_DIR: &str = "/etc/quorum";
const CERTS_DIR: &str = "/etc/quorum/certs";
const ANNOTATION_CONFIG_HASH: &str = "quorum.io/config-hash";

const DEFAULT_ENSEMBLE_IMAGE: &str = "ghcr.io/quorum-io/ensemble:latest";
const DEFAULT_CLUSTER_IMAGE: &str = "ghcr.io/quorum-io/cluster:latest";

/// Claim name the StatefulSet uses for `ordinal`.
pub fn claim_name(stateful_set: &str, ordinal: i32) -> String {
    format!("{}-{}-{}", DATA_VOLUME, stateful_set, ordinal)
}

/// Rendered view of one replica set of an assembly.
#[derive(Debug, Clone)]
pub struct ReplicaSetModel {
    assembly: String,
    namespace: String,
    component: Component,
    spec: ReplicaSetSpec,
    image: String,
}

impl ReplicaSetModel {
    /// Model for the coordination ensemble.
    pub fn ensemble(assembly: &QuorumAssembly) -> OperatorResult<Self> {
        Self::new(
            assembly,
            Component::Ensemble,
            &assembly.spec.ensemble,
            DEFAULT_ENSEMBLE_IMAGE,
        )
    }

    /// Model for the data-plane cluster.
    pub fn cluster(assembly: &QuorumAssembly) -> OperatorResult<Self> {
        Self::new(
            assembly,
            Component::Cluster,
            &assembly.spec.cluster,
            DEFAULT_CLUSTER_IMAGE,
        )
    }

    fn new(
        assembly: &QuorumAssembly,
        component: Component,
        spec: &ReplicaSetSpec,
        default_image: &str,
    ) -> OperatorResult<Self> {
        let name = assembly.name_any();
        let namespace = assembly
            .namespace()
            .ok_or_else(|| OperatorError::InvalidSpec("QuorumAssembly must be namespaced".into()))?;

        if spec.replicas < 1 {
            return Err(OperatorError::InvalidSpec(format!(
                "{} replicas must be at least 1, got {}",
                component, spec.replicas
            )));
        }
        if spec.storage.storage_type == StorageType::PersistentClaim
            && spec.storage.size.as_deref().is_none_or(str::is_empty)
        {
            return Err(OperatorError::InvalidSpec(format!(
                "{} storage of type persistent-claim requires a size",
                component
            )));
        }
        let image = match spec.image.as_deref() {
            Some("") => {
                return Err(OperatorError::InvalidSpec(format!(
                    "{} image must not be empty",
                    component
                )));
            }
            Some(image) => image.to_string(),
            None => default_image.to_string(),
        };

        Ok(Self {
            assembly: name,
            namespace,
            component,
            spec: spec.clone(),
            image,
        })
    }

    /// Which replica set this is.
    pub fn component(&self) -> Component {
        self.component
    }

    /// Namespace of the assembly.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// StatefulSet (and client Service) name.
    pub fn name(&self) -> String {
        self.component.resource_name(&self.assembly)
    }

    /// Headless Service name.
    pub fn headless_name(&self) -> String {
        self.component.headless_name(&self.assembly)
    }

    /// ConfigMap name.
    pub fn config_name(&self) -> String {
        self.component.config_name(&self.assembly)
    }

    /// Declared replica count.
    pub fn replicas(&self) -> i32 {
        self.spec.replicas
    }

    /// Whether each replica gets a PersistentVolumeClaim.
    pub fn is_persistent(&self) -> bool {
        self.spec.storage.storage_type == StorageType::PersistentClaim
    }

    /// Whether claims are deleted with the assembly.
    pub fn delete_claim(&self) -> bool {
        self.is_persistent() && self.spec.storage.delete_claim
    }

    fn metadata(&self, name: String) -> ObjectMeta {
        ObjectMeta {
            name: Some(name),
            namespace: Some(self.namespace.clone()),
            labels: Some(component_labels(&self.assembly, self.component)),
            ..Default::default()
        }
    }

    fn client_port(&self) -> i32 {
        match self.component {
            Component::Cluster => CLUSTER_CLIENT_PORT,
            _ => ENSEMBLE_CLIENT_PORT,
        }
    }

    fn ports(&self) -> Vec<(&'static str, i32)> {
        let mut ports = match self.component {
            Component::Cluster => vec![
                ("clients", CLUSTER_CLIENT_PORT),
                ("replication", CLUSTER_REPLICATION_PORT),
            ],
            _ => vec![
                ("clients", ENSEMBLE_CLIENT_PORT),
                ("peers", ENSEMBLE_PEER_PORT),
                ("election", ENSEMBLE_ELECTION_PORT),
            ],
        };
        if self.spec.metrics.is_some() {
            ports.push(("metrics", METRICS_PORT));
        }
        ports
    }

    fn service_ports(ports: &[(&str, i32)]) -> Vec<ServicePort> {
        ports
            .iter()
            .map(|(name, port)| ServicePort {
                name: Some(name.to_string()),
                port: *port,
                target_port: Some(IntOrString::Int(*port)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            })
            .collect()
    }

    /// Client Service.
    pub fn service(&self) -> Service {
        let ports: Vec<_> = self
            .ports()
            .into_iter()
            .filter(|(name, _)| *name == "clients" || *name == "metrics")
            .collect();

        Service {
            metadata: self.metadata(self.name()),
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                selector: Some(selector_labels(&self.assembly, self.component)),
                ports: Some(Self::service_ports(&ports)),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Headless Service giving each pod a stable DNS name.
    pub fn headless_service(&self) -> Service {
        let ports: Vec<_> = self
            .ports()
            .into_iter()
            .filter(|(name, _)| *name != "metrics")
            .collect();

        Service {
            metadata: self.metadata(self.headless_name()),
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".to_string()),
                publish_not_ready_addresses: Some(true),
                selector: Some(selector_labels(&self.assembly, self.component)),
                ports: Some(Self::service_ports(&ports)),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn server_properties(&self) -> String {
        let mut properties = BTreeMap::new();
        match self.component {
            Component::Cluster => {
                properties.insert(
                    "listeners".to_string(),
                    format!(
                        "CLIENT://0.0.0.0:{},REPLICATION://0.0.0.0:{}",
                        CLUSTER_CLIENT_PORT, CLUSTER_REPLICATION_PORT
                    ),
                );
                properties.insert(
                    "ensemble.connect".to_string(),
                    format!(
                        "{}:{}",
                        Component::Ensemble.resource_name(&self.assembly),
                        ENSEMBLE_CLIENT_PORT
                    ),
                );
                properties.insert("log.dirs".to_string(), DATA_DIR.to_string());
            }
            _ => {
                properties.insert("dataDir".to_string(), DATA_DIR.to_string());
                properties.insert("clientPort".to_string(), ENSEMBLE_CLIENT_PORT.to_string());
                properties.insert("tickTime".to_string(), "2000".to_string());
                properties.insert("initLimit".to_string(), "5".to_string());
                properties.insert("syncLimit".to_string(), "2".to_string());
                for ordinal in 0..self.spec.replicas {
                    properties.insert(
                        format!("server.{}", ordinal),
                        format!(
                            "{}-{}.{}.{}.svc:{}:{}",
                            self.name(),
                            ordinal,
                            self.headless_name(),
                            self.namespace,
                            ENSEMBLE_PEER_PORT,
                            ENSEMBLE_ELECTION_PORT
                        ),
                    );
                }
            }
        }
        properties.extend(self.spec.config.clone());

        properties
            .iter()
            .map(|(key, value)| format!("{}={}\n", key, value))
            .collect()
    }

    fn config_data(&self) -> BTreeMap<String, String> {
        let mut data = BTreeMap::new();
        data.insert("server.properties".to_string(), self.server_properties());
        if let Some(metrics) = &self.spec.metrics {
            // BTreeMap serialization cannot fail.
            let rendered = serde_json::to_string(metrics).unwrap_or_default();
            data.insert("metrics.json".to_string(), rendered);
        }
        data
    }

    /// ConfigMap holding `server.properties` and, with metrics, `metrics.json`.
    pub fn config_map(&self) -> ConfigMap {
        ConfigMap {
            metadata: self.metadata(self.config_name()),
            data: Some(self.config_data()),
            ..Default::default()
        }
    }

    fn claim_spec(&self) -> PersistentVolumeClaimSpec {
        let size = self.spec.storage.size.clone().unwrap_or_default();
        PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: self.spec.storage.class.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([("storage".to_string(), Quantity(size))])),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// One claim per ordinal for persistent storage, none otherwise. Each
    /// records whether it goes with the assembly.
    pub fn claims(&self) -> Vec<PersistentVolumeClaim> {
        if !self.is_persistent() {
            return Vec::new();
        }
        (0..self.spec.replicas)
            .map(|ordinal| {
                let mut metadata = self.metadata(claim_name(&self.name(), ordinal));
                metadata.annotations = Some(BTreeMap::from([(
                    ANNOTATION_DELETE_CLAIM.to_string(),
                    self.delete_claim().to_string(),
                )]));
                PersistentVolumeClaim {
                    metadata,
                    spec: Some(self.claim_spec()),
                    ..Default::default()
                }
            })
            .collect()
    }

    fn env(&self) -> Vec<EnvVar> {
        let mut env = vec![
            EnvVar {
                name: "QUORUM_POD_NAME".to_string(),
                value_from: Some(EnvVarSource {
                    field_ref: Some(ObjectFieldSelector {
                        field_path: "metadata.name".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
            EnvVar {
                name: "QUORUM_ASSEMBLY".to_string(),
                value: Some(self.assembly.clone()),
                ..Default::default()
            },
        ];
        env.extend(self.spec.env.iter().map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        }));
        env
    }

    fn pod_template(&self) -> PodTemplateSpec {
        let config_hash = hex::encode(Sha256::digest(
            serde_json::to_vec(&self.config_data()).unwrap_or_default(),
        ));

        let container = Container {
            name: self.component.as_str().to_string(),
            image: Some(self.image.clone()),
            ports: Some(
                self.ports()
                    .into_iter()
                    .map(|(name, port)| ContainerPort {
                        name: Some(name.to_string()),
                        container_port: port,
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            env: Some(self.env()),
            resources: container_resources(&self.spec.resources),
            readiness_probe: Some(Probe {
                tcp_socket: Some(TCPSocketAction {
                    port: IntOrString::Int(self.client_port()),
                    ..Default::default()
                }),
                initial_delay_seconds: Some(10),
                period_seconds: Some(10),
                ..Default::default()
            }),
            volume_mounts: Some(vec![
                VolumeMount {
                    name: DATA_VOLUME.to_string(),
                    mount_path: DATA_DIR.to_string(),
                    ..Default::default()
                },
                VolumeMount {
                    name: "config".to_string(),
                    mount_path: CONFIG_DIR.to_string(),
                    ..Default::default()
                },
                VolumeMount {
                    name: "certs".to_string(),
                    mount_path: CERTS_DIR.to_string(),
                    read_only: Some(true),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        };

        let mut volumes = vec![
            Volume {
                name: "config".to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: self.config_name(),
                    ..Default::default()
                }),
                ..Default::default()
            },
            Volume {
                name: "certs".to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(self.component.certs_name(&self.assembly)),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ];
        if !self.is_persistent() {
            volumes.push(Volume {
                name: DATA_VOLUME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            });
        }

        PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(component_labels(&self.assembly, self.component)),
                annotations: Some(BTreeMap::from([(
                    ANNOTATION_CONFIG_HASH.to_string(),
                    config_hash,
                )])),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                containers: vec![container],
                volumes: Some(volumes),
                termination_grace_period_seconds: Some(30),
                ..Default::default()
            }),
        }
    }

    /// StatefulSet. The generation token is added by the StatefulSet operator.
    pub fn stateful_set(&self) -> StatefulSet {
        let mut metadata = self.metadata(self.name());
        metadata.annotations = Some(BTreeMap::from([(
            ANNOTATION_DELETE_CLAIM.to_string(),
            self.delete_claim().to_string(),
        )]));

        let claim_templates = self.is_persistent().then(|| {
            vec![PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some(DATA_VOLUME.to_string()),
                    labels: Some(component_labels(&self.assembly, self.component)),
                    ..Default::default()
                },
                spec: Some(self.claim_spec()),
                ..Default::default()
            }]
        });

        StatefulSet {
            metadata,
            spec: Some(StatefulSetSpec {
                replicas: Some(self.spec.replicas),
                service_name: self.headless_name(),
                selector: LabelSelector {
                    match_labels: Some(selector_labels(&self.assembly, self.component)),
                    ..Default::default()
                },
                template: self.pod_template(),
                volume_claim_templates: claim_templates,
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Container resources from the assembly's requests and limits.
pub(crate) fn container_resources(spec: &ResourceRequirements) -> Option<ContainerResources> {
    let quantities = |resources: &Option<crate::crd::ResourceSpec>| {
        let resources = resources.as_ref()?;
        let mut map = BTreeMap::new();
        if let Some(cpu) = &resources.cpu {
            map.insert("cpu".to_string(), Quantity(cpu.clone()));
        }
        if let Some(memory) = &resources.memory {
            map.insert("memory".to_string(), Quantity(memory.clone()));
        }
        (!map.is_empty()).then_some(map)
    };

    let requests = quantities(&spec.requests);
    let limits = quantities(&spec.limits);
    if requests.is_none() && limits.is_none() {
        return None;
    }
    Some(ContainerResources {
        requests,
        limits,
        ..Default::default()
    })
}
