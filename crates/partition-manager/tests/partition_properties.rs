use std::thread;

use api_types::ComputeSize;
use partition_manager::mock::mock_services;
use partition_manager::mock::reference_chip;
use partition_manager::ClientInfo;
use partition_manager::ComputeInstanceCreate;
use partition_manager::ComputeRequest;
use partition_manager::ComputeShape;
use partition_manager::EngineKind;
use partition_manager::GpuInstanceCreate;
use partition_manager::GpuInstanceId;
use partition_manager::GpuInstanceRequest;
use partition_manager::InstanceRef;
use partition_manager::PartitionError;
use partition_manager::PartitionManager;
use partition_manager::PrivilegeLevel;
use partition_manager::SharedEngineFlags;
use partition_manager::SharedPartitionManager;
use partition_manager::SnapshotStore;
use partition_manager::SubscriptionTarget;
use partition_manager::VaSpaceSharing;
use partition_manager::ids::VaSpaceGroupId;
use similar_asserts::assert_eq;
use uuid::Uuid;

const FULL: u32 = 0;
const HALF: u32 = 1;
const QUARTER: u32 = 2;
const EIGHTH: u32 = 3;

fn manager() -> PartitionManager {
    let (services, _, _) = mock_services();
    PartitionManager::new(reference_chip(), Uuid::nil(), services).unwrap()
}

fn create_gi(manager: &mut PartitionManager, flag: u32) -> Result<GpuInstanceId, PartitionError> {
    manager.create_gpu_instance(GpuInstanceCreate::Request(GpuInstanceRequest::new(flag)))
}

fn sized(size: ComputeSize) -> ComputeRequest {
    ComputeRequest::new(ComputeShape::Size(size))
}

/// Neither GPU instances nor their compute instances may share an
/// exclusive engine or an overlapping slot.
fn assert_no_double_allocation(manager: &PartitionManager) {
    let infos = manager.describe_all_gpu_instances();
    for (i, a) in infos.iter().enumerate() {
        for b in &infos[i + 1..] {
            assert_eq!(a.engine_mask & b.engine_mask, 0);
            assert!(a.gpc_ids.iter().all(|g| !b.gpc_ids.contains(g)));
        }
    }
    for id in manager.gpu_instance_ids() {
        let gi = manager.describe_gpu_instance(id).unwrap();
        assert_eq!(gi.exclusive_engine_mask & gi.shared_engine_mask, 0);
        let cis = manager.describe_active_compute_instances(id).unwrap();
        for (i, a) in cis.iter().enumerate() {
            for b in &cis[i + 1..] {
                let exclusive = gi.exclusive_engine_mask;
                assert_eq!(a.engine_mask & b.engine_mask & exclusive, 0);
                assert!(a.gpc_ids.iter().all(|g| !b.gpc_ids.contains(g)));
            }
        }
    }
}

#[test]
fn half_instances_scenario() {
    let mut manager = manager();
    let first = create_gi(&mut manager, HALF).unwrap();
    let second = create_gi(&mut manager, HALF).unwrap();

    let a = manager.describe_gpu_instance(first).unwrap();
    let b = manager.describe_gpu_instance(second).unwrap();
    assert_eq!(a.gpc_ids, vec![0, 1, 2, 3]);
    assert_eq!(b.gpc_ids, vec![4, 5, 6, 7]);
    assert_eq!(a.engine_mask & b.engine_mask, 0);

    assert!(matches!(
        create_gi(&mut manager, HALF),
        Err(PartitionError::InsufficientResources { .. })
    ));

    manager.invalidate_gpu_instance(first, false).unwrap();
    let third = create_gi(&mut manager, HALF).unwrap();
    assert_eq!(manager.describe_gpu_instance(third).unwrap().gpc_ids, vec![0, 1, 2, 3]);
}

#[test]
fn mixed_sequence_never_double_allocates() {
    let mut manager = manager();
    let quarter = create_gi(&mut manager, QUARTER).unwrap();
    let half = create_gi(&mut manager, HALF).unwrap();
    let eighth = create_gi(&mut manager, EIGHTH).unwrap();
    assert_no_double_allocation(&manager);

    let cis = manager
        .create_compute_instances(
            half,
            ComputeInstanceCreate::Request(vec![
                sized(ComputeSize::Quarter).with_engines(EngineKind::Copy, 1),
                sized(ComputeSize::Eighth)
                    .with_engines(EngineKind::Copy, 2)
                    .shared(SharedEngineFlags::COPY),
                sized(ComputeSize::Eighth)
                    .with_engines(EngineKind::Copy, 1)
                    .shared(SharedEngineFlags::COPY),
            ]),
            false,
        )
        .unwrap();
    manager
        .create_compute_instances(
            quarter,
            ComputeInstanceCreate::Request(vec![sized(ComputeSize::Eighth), sized(ComputeSize::Eighth)]),
            false,
        )
        .unwrap();
    assert_no_double_allocation(&manager);

    manager.delete_compute_instance(half, cis[1], false).unwrap();
    manager.invalidate_gpu_instance(eighth, false).unwrap();
    create_gi(&mut manager, EIGHTH).unwrap();
    create_gi(&mut manager, EIGHTH).unwrap();
    assert_no_double_allocation(&manager);

    // the device is now full
    assert!(create_gi(&mut manager, EIGHTH).is_err());
    assert!(create_gi(&mut manager, FULL).is_err());
}

#[test]
fn failed_batch_leaves_no_trace() {
    let (services, heaps, handles) = mock_services();
    let mut manager = PartitionManager::new(reference_chip(), Uuid::nil(), services).unwrap();
    let gi = create_gi(&mut manager, HALF).unwrap();
    let before = manager.describe_gpu_instance(gi).unwrap();
    let live = handles.live_handles();

    // the third request asks for more decoders than the instance owns
    let requests = vec![
        sized(ComputeSize::Eighth).with_engines(EngineKind::Nvdec, 1),
        sized(ComputeSize::Eighth).with_engines(EngineKind::Nvdec, 1),
        sized(ComputeSize::Eighth).with_engines(EngineKind::Nvdec, 1),
    ];
    assert!(matches!(
        manager.create_compute_instances(gi, ComputeInstanceCreate::Request(requests), false),
        Err(PartitionError::InsufficientEngines {
            kind: EngineKind::Nvdec,
            ..
        })
    ));

    // the second install runs out of handles
    handles.fail_after(4);
    let requests = vec![sized(ComputeSize::Eighth), sized(ComputeSize::Eighth)];
    assert!(manager
        .create_compute_instances(gi, ComputeInstanceCreate::Request(requests), false)
        .is_err());
    handles.stop_failing();

    assert_eq!(manager.describe_gpu_instance(gi).unwrap(), before);
    assert_eq!(handles.live_handles(), live);
    assert_eq!(heaps.live_heaps(), 1);
}

#[test]
fn refcount_tracks_subscribe_and_duplicate() {
    let mut manager = manager();
    let gi = create_gi(&mut manager, QUARTER).unwrap();
    let kernel = manager.register_client(ClientInfo {
        privilege: PrivilegeLevel::Kernel,
        va_space: VaSpaceSharing::Private,
    });
    let others: Vec<_> = (0..3)
        .map(|_| {
            manager.register_client(ClientInfo {
                privilege: PrivilegeLevel::User,
                va_space: VaSpaceSharing::Private,
            })
        })
        .collect();

    let target = SubscriptionTarget::Partition(InstanceRef::Gpu(gi));
    let original = manager.subscribe(kernel, target).unwrap();
    let mut handles = vec![original];
    for client in &others {
        handles.push(manager.duplicate_subscription(kernel, original, *client).unwrap());
    }

    for (released, handle) in handles.iter().enumerate() {
        assert!(!manager.ready_to_destroy(gi).unwrap());
        assert_eq!(
            manager.describe_gpu_instance(gi).unwrap().subscriber_count as usize,
            handles.len() - released
        );
        manager.unsubscribe(*handle).unwrap();
    }
    assert!(manager.ready_to_destroy(gi).unwrap());
}

#[test]
fn placement_is_deterministic() {
    let shape = || {
        let mut manager = manager();
        let gi = create_gi(&mut manager, HALF).unwrap();
        manager
            .create_compute_instances(
                gi,
                ComputeInstanceCreate::Request(vec![
                    sized(ComputeSize::Eighth),
                    sized(ComputeSize::Quarter),
                    sized(ComputeSize::Eighth),
                ]),
                false,
            )
            .unwrap();
        manager.describe_active_compute_instances(gi).unwrap()
    };
    let first = shape();
    assert_eq!(first, shape());
    assert_eq!(
        first.iter().map(|ci| ci.placement_id).collect::<Vec<_>>(),
        vec![13, 6, 14]
    );
}

#[test]
fn isolation_denies_spanning_address_space() {
    let mut manager = manager();
    let a = create_gi(&mut manager, HALF).unwrap();
    let b = create_gi(&mut manager, HALF).unwrap();
    let group = VaSpaceSharing::Group(VaSpaceGroupId(1));
    let first = manager.register_client(ClientInfo {
        privilege: PrivilegeLevel::User,
        va_space: group,
    });
    let second = manager.register_client(ClientInfo {
        privilege: PrivilegeLevel::User,
        va_space: group,
    });

    let held = manager
        .subscribe(first, SubscriptionTarget::Partition(InstanceRef::Gpu(a)))
        .unwrap();
    assert!(manager
        .subscribe(second, SubscriptionTarget::Partition(InstanceRef::Gpu(b)))
        .is_err());

    manager.unsubscribe(held).unwrap();
    manager
        .subscribe(second, SubscriptionTarget::Partition(InstanceRef::Gpu(b)))
        .unwrap();
}

#[test]
fn topology_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store = SnapshotStore::new(dir.path().join("topology.json"));

    let mut original = manager();
    let half = create_gi(&mut original, HALF).unwrap();
    create_gi(&mut original, QUARTER).unwrap();
    original
        .create_compute_instances(
            half,
            ComputeInstanceCreate::Request(vec![
                sized(ComputeSize::MiniQuarter).with_engines(EngineKind::Nvjpg, 1),
                sized(ComputeSize::Eighth)
                    .with_engines(EngineKind::Copy, 2)
                    .shared(SharedEngineFlags::COPY),
            ]),
            false,
        )
        .unwrap();
    store.save(&original.save_topology()).unwrap();
    original.teardown().unwrap();
    assert!(original.describe_all_gpu_instances().is_empty());

    let mut restored = manager();
    restored.restore_topology(&store.load().unwrap()).unwrap();
    let mut again = restored.save_topology();
    let saved = store.load().unwrap();
    again.saved_at = saved.saved_at;
    assert_eq!(again, saved);
}

#[test]
fn restore_never_shares_live_resources() {
    let mut source = manager();
    create_gi(&mut source, HALF).unwrap();
    let upper = create_gi(&mut source, HALF).unwrap();
    source
        .create_compute_instances(
            upper,
            ComputeInstanceCreate::Request(vec![
                sized(ComputeSize::Eighth),
                sized(ComputeSize::Eighth),
            ]),
            false,
        )
        .unwrap();
    let mut snapshot = source.save_topology();
    snapshot.gpu_instances.remove(0);
    assert_eq!(snapshot.gpu_instances[0].swizz_id, 2);

    let mut target = manager();
    create_gi(&mut target, HALF).unwrap();
    let engines = target.engines_in_use();

    // the upper half names the GPCs and VEIDs of the live lower half
    let mut stolen = snapshot.clone();
    stolen.gpu_instances[0].gpc_mask = 0b1111;
    stolen.gpu_instances[0].veid_offset = 0;
    assert!(matches!(
        target.restore_topology(&stolen),
        Err(PartitionError::StateInUse { .. })
    ));
    assert_eq!(target.describe_all_gpu_instances().len(), 1);
    assert_eq!(target.engines_in_use(), engines);

    // two compute instances of one snapshot on the same GPC
    let mut twins = snapshot.clone();
    let cis = &mut twins.gpu_instances[0].compute_instances;
    cis[1].gpc_mask = cis[0].gpc_mask;
    assert!(matches!(
        target.restore_topology(&twins),
        Err(PartitionError::StateInUse { .. })
    ));
    assert_eq!(target.describe_all_gpu_instances().len(), 1);
    assert_eq!(target.engines_in_use(), engines);

    target.restore_topology(&snapshot).unwrap();
    assert_eq!(target.describe_all_gpu_instances().len(), 2);
    assert_no_double_allocation(&target);
}

#[test]
fn shared_manager_serializes_writers() {
    let shared = SharedPartitionManager::new(manager());
    let workers: Vec<_> = (0..8)
        .map(|_| {
            let shared = shared.clone();
            thread::spawn(move || {
                shared
                    .write()
                    .unwrap()
                    .create_gpu_instance(GpuInstanceCreate::Request(GpuInstanceRequest::new(EIGHTH)))
                    .is_ok()
            })
        })
        .collect();
    let created = workers
        .into_iter()
        .map(|worker| worker.join().unwrap())
        .filter(|ok| *ok)
        .count();
    assert_eq!(created, 8);

    let manager = shared.read().unwrap();
    assert_eq!(manager.active_partition_ids(), (7..15).collect::<Vec<_>>());
    assert_no_double_allocation(&manager);
}
