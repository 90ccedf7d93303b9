//! Client subscriptions to partitions.
//!
//! A subscription holds the [`Share`] of every instance it references, so
//! the instance's subscriber count is simply the number of outstanding
//! clones. Dropping the subscription drops the clones.

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::PartitionError;
use crate::error::Result;
use crate::ids::ClientId;
use crate::ids::ComputeInstanceId;
use crate::ids::GpuInstanceId;
use crate::ids::Handle;
use crate::ids::SubscriptionHandle;
use crate::ids::VaSpaceGroupId;
use crate::manager::PartitionManager;
use crate::reference::InstanceRef;
use crate::services::HandleService;
use crate::share::Share;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivilegeLevel {
    User,
    Admin,
    Kernel,
}

impl fmt::Display for PrivilegeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrivilegeLevel::User => f.write_str("user"),
            PrivilegeLevel::Admin => f.write_str("admin"),
            PrivilegeLevel::Kernel => f.write_str("kernel"),
        }
    }
}

/// How a client's virtual address space is shared with other clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VaSpaceSharing {
    Private,
    Group(VaSpaceGroupId),
    /// Legacy single address space shared by every global client
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientInfo {
    pub privilege: PrivilegeLevel,
    pub va_space: VaSpaceSharing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionTarget {
    Partition(InstanceRef),
    /// Device-wide profiling singleton
    DeviceProfiling,
}

impl SubscriptionTarget {
    pub fn gpu_instance(&self) -> Option<GpuInstanceId> {
        match self {
            SubscriptionTarget::Partition(reference) => reference.gpu_instance(),
            SubscriptionTarget::DeviceProfiling => None,
        }
    }

    pub fn compute_instance(&self) -> Option<(GpuInstanceId, ComputeInstanceId)> {
        match self {
            SubscriptionTarget::Partition(InstanceRef::Compute(gi, ci)) => Some((*gi, *ci)),
            _ => None,
        }
    }
}

struct ClientRecord {
    info: ClientInfo,
    subscription: Option<SubscriptionHandle>,
    /// Handles the client created inside a partition
    resources: Vec<(GpuInstanceId, Handle)>,
}

struct Subscription {
    client: ClientId,
    target: SubscriptionTarget,
    _shares: Vec<Share>,
}

#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    clients: BTreeMap<ClientId, ClientRecord>,
    subscriptions: BTreeMap<SubscriptionHandle, Subscription>,
    profiling: Option<SubscriptionHandle>,
    next_client: u64,
    next_subscription: u64,
}

impl SubscriptionRegistry {
    fn client(&self, client: ClientId) -> Result<&ClientRecord> {
        self.clients
            .get(&client)
            .ok_or_else(|| PartitionError::not_found(format!("{client}")))
    }

    fn client_mut(&mut self, client: ClientId) -> Result<&mut ClientRecord> {
        self.clients
            .get_mut(&client)
            .ok_or_else(|| PartitionError::not_found(format!("{client}")))
    }

    fn target_of(&self, client: ClientId) -> Option<SubscriptionTarget> {
        let handle = self.clients.get(&client)?.subscription?;
        self.subscriptions.get(&handle).map(|s| s.target)
    }

    fn insert(&mut self, client: ClientId, target: SubscriptionTarget, shares: Vec<Share>) -> SubscriptionHandle {
        self.next_subscription += 1;
        let handle = SubscriptionHandle(self.next_subscription);
        self.subscriptions.insert(
            handle,
            Subscription {
                client,
                target,
                _shares: shares,
            },
        );
        if let Some(record) = self.clients.get_mut(&client) {
            record.subscription = Some(handle);
        }
        if target == SubscriptionTarget::DeviceProfiling {
            self.profiling = Some(handle);
        }
        handle
    }

    /// Drops a subscription and frees the partition-scoped resources its
    /// client created under it.
    fn remove(&mut self, handle: SubscriptionHandle, handles: &dyn HandleService) -> Option<Subscription> {
        let subscription = self.subscriptions.remove(&handle)?;
        if self.profiling == Some(handle) {
            self.profiling = None;
        }
        if let Some(record) = self.clients.get_mut(&subscription.client) {
            record.subscription = None;
            if let Some(gi) = subscription.target.gpu_instance() {
                let (scoped, kept): (Vec<_>, Vec<_>) =
                    record.resources.drain(..).partition(|(owner, _)| *owner == gi);
                record.resources = kept;
                for (_, resource) in scoped {
                    if let Err(err) = handles.free_handle(resource) {
                        warn!(
                            client = %subscription.client,
                            handle = resource.0,
                            error = %err,
                            "failed to free partition-scoped handle"
                        );
                    }
                }
            }
        }
        Some(subscription)
    }

    /// Drops every subscription whose target matches `predicate`.
    pub(crate) fn purge(
        &mut self,
        handles: &dyn HandleService,
        predicate: impl Fn(&SubscriptionTarget) -> bool,
    ) {
        let doomed: Vec<SubscriptionHandle> = self
            .subscriptions
            .iter()
            .filter(|(_, s)| predicate(&s.target))
            .map(|(handle, _)| *handle)
            .collect();
        for handle in doomed {
            if let Some(subscription) = self.remove(handle, handles) {
                info!(
                    subscription = %handle,
                    client = %subscription.client,
                    "subscription revoked by partition teardown"
                );
            }
        }
    }
}

impl PartitionManager {
    pub fn register_client(&mut self, info: ClientInfo) -> ClientId {
        let registry = &mut self.subscriptions;
        registry.next_client += 1;
        let client = ClientId(registry.next_client);
        registry.clients.insert(
            client,
            ClientRecord {
                info,
                subscription: None,
                resources: Vec::new(),
            },
        );
        debug!(client = %client, privilege = %info.privilege, "client registered");
        client
    }

    /// Drops the client's subscription and every resource it still tracks.
    pub fn unregister_client(&mut self, client: ClientId) -> Result<()> {
        let handle_service = self.services.handles.clone();
        if let Some(handle) = self.subscriptions.client(client)?.subscription {
            self.subscriptions.remove(handle, handle_service.as_ref());
        }
        let record = self
            .subscriptions
            .clients
            .remove(&client)
            .ok_or_else(|| PartitionError::not_found(format!("{client}")))?;
        for (_, resource) in record.resources {
            if let Err(err) = handle_service.free_handle(resource) {
                warn!(client = %client, handle = resource.0, error = %err, "failed to free client handle");
            }
        }
        debug!(client = %client, "client unregistered");
        Ok(())
    }

    pub fn client_info(&self, client: ClientId) -> Result<ClientInfo> {
        Ok(self.subscriptions.client(client)?.info)
    }

    /// Records a handle the client created inside its subscribed GPU
    /// instance, to be freed when the subscription goes away.
    pub fn track_partition_resource(&mut self, client: ClientId, resource: Handle) -> Result<()> {
        let gi = self
            .subscriptions
            .target_of(client)
            .and_then(|target| target.gpu_instance())
            .ok_or_else(|| {
                PartitionError::invalid_state(format!("{client} is not subscribed to a partition"))
            })?;
        self.subscriptions
            .client_mut(client)?
            .resources
            .push((gi, resource));
        Ok(())
    }

    pub fn subscription_target(&self, client: ClientId) -> Result<Option<SubscriptionTarget>> {
        self.subscriptions.client(client)?;
        Ok(self.subscriptions.target_of(client))
    }

    /// Subscribes `client` to a partition or to device-level profiling.
    pub fn subscribe(&mut self, client: ClientId, target: SubscriptionTarget) -> Result<SubscriptionHandle> {
        let record = self.subscriptions.client(client)?;
        if record.subscription.is_some() {
            return Err(PartitionError::in_use(format!("{client} already holds a subscription")));
        }
        let privilege = record.info.privilege;
        let shares = match target {
            SubscriptionTarget::DeviceProfiling => {
                if self.subscriptions.profiling.is_some() {
                    return Err(PartitionError::in_use("device profiling is already held"));
                }
                if privilege < PrivilegeLevel::Admin
                    && !self.chip.device.allow_unprivileged_device_profiling
                {
                    return Err(PartitionError::InsufficientPermissions {
                        required: PrivilegeLevel::Admin,
                    });
                }
                Vec::new()
            }
            SubscriptionTarget::Partition(reference) => self.partition_shares(client, reference)?,
        };

        let handle = self.subscriptions.insert(client, target, shares);
        info!(client = %client, subscription = %handle, target = ?target, "subscribed");
        Ok(handle)
    }

    fn partition_shares(&self, client: ClientId, reference: InstanceRef) -> Result<Vec<Share>> {
        let gi_id = reference
            .gpu_instance()
            .ok_or_else(|| PartitionError::invalid_argument("cannot subscribe to the unpartitioned device"))?;
        let gi = self.gpu_instance(gi_id)?;
        let mut shares = vec![gi.share.clone()];
        if let Some(ci) = reference.compute_instance() {
            shares.push(gi.compute_instance(ci)?.share.clone());
        }
        if self.cross_partition_isolation_check(client, gi_id)? {
            warn!(client = %client, gpu_instance = %gi_id, "subscription denied by address-space isolation");
            return Err(PartitionError::in_use(format!(
                "{client} shares an address space with a client of another partition"
            )));
        }
        Ok(shares)
    }

    /// Hands a copy of an existing subscription to `new_client`. Only
    /// kernel callers may do this; profiling subscriptions never duplicate.
    pub fn duplicate_subscription(
        &mut self,
        caller: ClientId,
        handle: SubscriptionHandle,
        new_client: ClientId,
    ) -> Result<SubscriptionHandle> {
        if self.subscriptions.client(caller)?.info.privilege < PrivilegeLevel::Kernel {
            return Err(PartitionError::InsufficientPermissions {
                required: PrivilegeLevel::Kernel,
            });
        }
        let target = self
            .subscriptions
            .subscriptions
            .get(&handle)
            .map(|s| s.target)
            .ok_or_else(|| PartitionError::not_found(format!("{handle}")))?;
        let SubscriptionTarget::Partition(reference) = target else {
            return Err(PartitionError::invalid_argument(
                "device profiling subscriptions cannot be duplicated",
            ));
        };
        if self.subscriptions.client(new_client)?.subscription.is_some() {
            return Err(PartitionError::in_use(format!(
                "{new_client} already holds a subscription"
            )));
        }
        let shares = self.partition_shares(new_client, reference)?;

        let duplicate = self.subscriptions.insert(new_client, target, shares);
        info!(from = %handle, to = %duplicate, client = %new_client, "subscription duplicated");
        Ok(duplicate)
    }

    /// Drops a subscription. Partition-scoped resources its client created
    /// are freed with it.
    pub fn unsubscribe(&mut self, handle: SubscriptionHandle) -> Result<()> {
        let handle_service = self.services.handles.clone();
        let subscription = self
            .subscriptions
            .remove(handle, handle_service.as_ref())
            .ok_or_else(|| PartitionError::not_found(format!("{handle}")))?;
        info!(client = %subscription.client, subscription = %handle, "unsubscribed");
        Ok(())
    }

    /// True when subscribing `client` to `gpu_instance` would let one
    /// virtual address space span two partitions.
    pub fn cross_partition_isolation_check(
        &self,
        client: ClientId,
        gpu_instance: GpuInstanceId,
    ) -> Result<bool> {
        let va_space = self.subscriptions.client(client)?.info.va_space;
        let registry = &self.subscriptions;
        let conflicts = |other: ClientId| match registry.target_of(other) {
            Some(SubscriptionTarget::Partition(reference)) => {
                reference.gpu_instance() != Some(gpu_instance)
            }
            Some(SubscriptionTarget::DeviceProfiling) => false,
            None => va_space == VaSpaceSharing::Global,
        };
        let deny = match va_space {
            VaSpaceSharing::Private => false,
            VaSpaceSharing::Group(_) | VaSpaceSharing::Global => registry
                .clients
                .iter()
                .filter(|(id, record)| **id != client && record.info.va_space == va_space)
                .any(|(id, _)| conflicts(*id)),
        };
        Ok(deny)
    }
}
