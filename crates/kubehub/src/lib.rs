//! freightline kubehub: Kargo CRD event source over the kube-rs watcher.
//!
//! A scope maps to a Kargo project namespace. Stage, Warehouse and Freight
//! objects (`kargo.akuity.io/v1alpha1`) are watched per namespace and turned
//! into freightline events.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use freightline_core::{Event, Kind, Resource, Scope};
use freightline_watch::{EventSource, EventStream, SourceError};
use futures::{stream, StreamExt, TryStreamExt};
use kube::{
    api::{Api, ListParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    runtime::watcher::{self, Event as WatchEvent},
    Client,
};
use tracing::{debug, info};

pub const KARGO_GROUP: &str = "kargo.akuity.io";
pub const KARGO_VERSION: &str = "v1alpha1";

/// API resource descriptor for a freightline kind.
pub fn api_resource(kind: Kind) -> ApiResource {
    let gvk = GroupVersionKind::gvk(KARGO_GROUP, KARGO_VERSION, kind.as_str());
    ApiResource::from_gvk_with_plural(&gvk, kind.plural())
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

/// Convert a dynamic object into a resource of `kind` in `scope`.
pub fn resource_from(obj: &DynamicObject, scope: &Scope, kind: Kind) -> Result<Resource> {
    let name = obj.metadata.name.clone().ok_or_else(|| anyhow!("object missing metadata.name"))?;
    let mut payload = serde_json::to_value(obj).context("serializing DynamicObject")?;
    strip_managed_fields(&mut payload);
    let mut res = Resource::new(scope.clone(), kind, name, payload);
    res.version = obj.metadata.resource_version.clone();
    Ok(res)
}

/// Map one watcher event to freightline events.
///
/// `Applied` covers both creation and update, so it becomes `Modified`; a
/// relist (`Restarted`) re-adds every listed object. Objects without a name
/// are skipped.
fn events_from(ev: WatchEvent<DynamicObject>, scope: &Scope, kind: Kind) -> Vec<Event> {
    let convert = |o: &DynamicObject| match resource_from(o, scope, kind) {
        Ok(r) => Some(r),
        Err(e) => {
            debug!(scope = %scope, kind = %kind, error = %e, "kube: object skipped");
            None
        }
    };
    match ev {
        WatchEvent::Applied(o) => convert(&o).map(Event::modified).into_iter().collect(),
        WatchEvent::Deleted(o) => convert(&o).map(Event::deleted).into_iter().collect(),
        WatchEvent::Restarted(list) => {
            debug!(scope = %scope, kind = %kind, count = list.len(), "kube: watch restart");
            list.iter().filter_map(convert).map(Event::added).collect()
        }
    }
}

/// Event source backed by a Kubernetes cluster running Kargo.
#[derive(Clone)]
pub struct KubeEventSource {
    client: Client,
}

impl KubeEventSource {
    pub fn new(client: Client) -> Self { Self { client } }

    /// Connect using the default kubeconfig / in-cluster configuration.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await.context("building kube client")?;
        Ok(Self { client })
    }

    fn api(&self, scope: &Scope, kind: Kind) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), scope.as_str(), &api_resource(kind))
    }
}

#[async_trait]
impl EventSource for KubeEventSource {
    async fn subscribe(&self, scope: &Scope, kind: Kind) -> Result<EventStream, SourceError> {
        let api = self.api(scope, kind);
        let owned_scope = scope.clone();
        info!(scope = %scope, kind = %kind, "kube: watcher started");
        let s = watcher::watcher(api, watcher::Config::default())
            .map_err(|e| SourceError::Transport(e.to_string()))
            .map_ok(move |ev| stream::iter(events_from(ev, &owned_scope, kind).into_iter().map(Ok::<Event, SourceError>)))
            .try_flatten();
        Ok(s.boxed())
    }

    async fn list(&self, scope: &Scope, kind: Kind) -> Result<Vec<Resource>, SourceError> {
        let api = self.api(scope, kind);
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| SourceError::Transport(e.to_string()))?;
        let mut out = Vec::with_capacity(list.items.len());
        for o in list.items.iter() {
            match resource_from(o, scope, kind) {
                Ok(r) => out.push(r),
                Err(e) => debug!(scope = %scope, kind = %kind, error = %e, "kube: listed object skipped"),
            }
        }
        info!(scope = %scope, kind = %kind, items = out.len(), "kube: list ok");
        Ok(out)
    }
}
