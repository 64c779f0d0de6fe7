// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Child object names and desired shapes.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use kube::ResourceExt;

use crate::crd::EventProvider;

/// Label selecting the receiver pods of a deployment.
pub const APP_LABEL: &str = "app";

/// Replicas of every receiver deployment.
pub const RECEIVER_REPLICAS: i32 = 2;

/// Port the receiver listens on and the service exposes.
pub const RECEIVER_PORT: i32 = 80;

/// Names of the objects derived from one EventProvider.
///
/// A pure function of the EventProvider's name and spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildNames {
    /// `{name}-{storageAccount}-deployment`
    pub deployment: String,
    /// `{name}-{storageAccount}-service`
    pub service: String,
    /// `{name}-{host}-ingress`
    pub ingress: String,
}

impl ChildNames {
    /// Derives the child names of `ep`.
    pub fn for_provider(ep: &EventProvider) -> Self {
        let name = ep.name_any();
        let spec = &ep.spec;
        Self {
            deployment: format!("{}-{}-deployment", name, spec.storage_account),
            service: format!("{}-{}-service", name, spec.storage_account),
            ingress: format!("{}-{}-ingress", name, spec.host),
        }
    }
}

fn app_labels(deployment_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(APP_LABEL.to_string(), deployment_name.to_string())])
}

/// Receiver deployment running the EventProvider's image.
pub fn new_deployment(ep: &EventProvider, namespace: &str, name: &str) -> Deployment {
    let labels = app_labels(name);

    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(RECEIVER_REPLICAS),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: name.to_string(),
                        image: Some(ep.spec.host_image.clone()),
                        ports: Some(vec![ContainerPort {
                            container_port: RECEIVER_PORT,
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Service in front of the receiver pods.
pub fn new_service(namespace: &str, name: &str, deployment_name: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(app_labels(deployment_name)),
            ports: Some(vec![ServicePort {
                name: Some(format!("eventgrid-{}", RECEIVER_PORT)),
                port: RECEIVER_PORT,
                target_port: Some(IntOrString::Int(RECEIVER_PORT)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Ingress object without routing rules.
pub fn new_ingress(namespace: &str, name: &str) -> Ingress {
    Ingress {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(IngressSpec::default()),
        ..Default::default()
    }
}

/// Routes `host` to the service's receiver port, with TLS from `secret`
/// when one is given.
pub fn with_host_rule(mut ingress: Ingress, host: &str, service_name: &str, secret: &str) -> Ingress {
    let spec = ingress.spec.get_or_insert_with(Default::default);

    spec.rules = Some(vec![IngressRule {
        host: Some(host.to_string()),
        http: Some(HTTPIngressRuleValue {
            paths: vec![HTTPIngressPath {
                path: Some("/".to_string()),
                path_type: "Prefix".to_string(),
                backend: IngressBackend {
                    service: Some(IngressServiceBackend {
                        name: service_name.to_string(),
                        port: Some(ServiceBackendPort {
                            number: Some(RECEIVER_PORT),
                            ..Default::default()
                        }),
                    }),
                    ..Default::default()
                },
            }],
        }),
    }]);

    if !secret.is_empty() {
        spec.tls = Some(vec![IngressTLS {
            hosts: Some(vec![host.to_string()]),
            secret_name: Some(secret.to_string()),
        }]);
    }

    ingress
}
