// session_tests.rs - End-to-end session scenarios against the simulator
//
// Each test spins up the in-process PLC simulator, points a SessionManager
// at it, and checks both the caller-visible results and the frames the
// simulator observed.

mod common;

use common::{sim_config, PlcSimulator, SimBehavior, SimEvent};
use enip_link::{EnipLinkError, SessionManager};
use tokio::time::{sleep, Duration};

fn behavior_with_assembly_data() -> SimBehavior {
    let mut behavior = SimBehavior::default();
    behavior.attributes.insert(
        (4, 1, 3),
        vec![0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88],
    );
    behavior
}

#[tokio::test]
async fn register_and_tear_down() {
    let sim = PlcSimulator::spawn(SimBehavior::default()).await;
    let manager = SessionManager::new(sim_config(&sim));

    let diag = manager.open_session(None, None).await.unwrap();
    assert_eq!(diag.connection.enip_session_handle, 0x0000_00AB);
    assert!(diag.connection.connected);
    assert_eq!(diag.connection.last_status.general, 0);
    assert!(diag.keep_alive_active);
    assert_eq!(diag.host, sim.host());
    assert_eq!(diag.port, sim.port());

    let session_id = diag.session_id.clone();
    manager.close_session(&session_id).await.unwrap();

    // Closing a session leaves the shared pool connection in place; the
    // simulator must not see any teardown yet.
    assert!(!sim
        .events()
        .iter()
        .any(|e| matches!(e, SimEvent::Unregistered { .. } | SimEvent::ForwardClose)));

    // Closing a closed session is a no-op; other operations report the
    // session as gone.
    manager.close_session(&session_id).await.unwrap();
    assert!(matches!(
        manager.get_diagnostics(&session_id),
        Err(EnipLinkError::UnknownSession(_))
    ));

    // Draining the pools is what tears connections down: Forward Close,
    // then UnregisterSession with the registered handle.
    manager.shutdown().await;
    assert!(
        sim.wait_for(
            |e| matches!(e, SimEvent::Unregistered { handle } if *handle == 0x0000_00AB),
            Duration::from_secs(2),
        )
        .await,
        "pool drain never sent UnregisterSession for the session handle"
    );
    assert!(
        sim.events()
            .iter()
            .any(|e| matches!(e, SimEvent::ForwardClose)),
        "pool drain should Forward Close the Class 3 connection first"
    );
}

#[tokio::test]
async fn forward_open_and_class3_read() {
    let sim = PlcSimulator::spawn(behavior_with_assembly_data()).await;
    let manager = SessionManager::new(sim_config(&sim));

    let diag = manager.open_session(None, None).await.unwrap();
    assert_eq!(diag.connection.o_t_connection_id, 0x1122_3344);
    assert_eq!(diag.connection.t_o_connection_id, 0x5566_7788);
    let session_id = diag.session_id.clone();

    let result = manager.read_assembly(&session_id, 4, 1, 8).await.unwrap();
    assert_eq!(result.data_hex, "1122334455667788");
    assert_eq!(
        result.word_values,
        Some(vec![0x2211, 0x4433, 0x6655, 0x8877])
    );
    assert!(result.status.is_ok());

    // The wire carried a Class 3 frame: sequence 1, Get_Attribute_Single,
    // assembly path class 4 / instance 1 / attribute 3.
    let unit = sim
        .events()
        .into_iter()
        .find_map(|e| match e {
            SimEvent::UnitRequest {
                sequence,
                service,
                class_id,
                instance_id,
                attribute_id,
                ..
            } => Some((sequence, service, class_id, instance_id, attribute_id)),
            _ => None,
        })
        .expect("no connected request observed");
    assert_eq!(unit, (1, 0x0E, 4, 1, Some(3)));

    let diag = manager.get_diagnostics(&session_id).unwrap();
    assert_eq!(diag.connection.sequence_count, 1);
    manager.close_session(&session_id).await.unwrap();
}

#[tokio::test]
async fn cip_error_is_a_value_not_a_failure() {
    let mut behavior = behavior_with_assembly_data();
    behavior.write_status = 0x0C; // object state conflict
    let sim = PlcSimulator::spawn(behavior).await;
    let manager = SessionManager::new(sim_config(&sim));

    let session_id = manager.open_session(None, None).await.unwrap().session_id;

    let status = manager
        .write_assembly(&session_id, 4, 1, vec![0xFF; 4])
        .await
        .unwrap();
    assert_eq!(status.general, 0x0C);
    assert_eq!(status.extended, None);

    // The session survives and the connection is still good: a read on the
    // same session succeeds immediately.
    let diag = manager.get_diagnostics(&session_id).unwrap();
    assert_eq!(diag.connection.last_status.general, 0x0C);
    assert!(diag.connection.connected);

    let result = manager.read_assembly(&session_id, 4, 1, 8).await.unwrap();
    assert!(result.status.is_ok());
    let diag = manager.get_diagnostics(&session_id).unwrap();
    assert_eq!(diag.connection.last_status.general, 0);
    manager.close_session(&session_id).await.unwrap();
}

#[tokio::test]
async fn broken_socket_is_replaced_on_retry() {
    let sim = PlcSimulator::spawn(behavior_with_assembly_data()).await;
    let manager = SessionManager::new(sim_config(&sim));
    let session_id = manager.open_session(None, None).await.unwrap().session_id;

    assert!(manager.read_assembly(&session_id, 4, 1, 8).await.is_ok());

    // Drop the stream mid-reply on the next request.
    sim.set(|b| b.drop_before_reply = true);
    let err = manager
        .read_assembly(&session_id, 4, 1, 8)
        .await
        .expect_err("truncated reply must fail the operation");
    assert!(matches!(err, EnipLinkError::Transport { .. }));
    assert!(!manager.get_diagnostics(&session_id).unwrap().connection.connected);

    // The caller retries; the pool replaces the broken connection and the
    // exchange succeeds on a fresh one.
    let result = manager.read_assembly(&session_id, 4, 1, 8).await.unwrap();
    assert!(result.status.is_ok());
    let diag = manager.get_diagnostics(&session_id).unwrap();
    assert!(diag.connection.connected);
    assert_eq!(diag.connection.last_status.general, 0);

    let registrations = sim
        .events()
        .iter()
        .filter(|e| matches!(e, SimEvent::Registered { .. }))
        .count();
    assert_eq!(registrations, 2, "replacement must register a new session");
    manager.close_session(&session_id).await.unwrap();
}

#[tokio::test]
async fn closing_one_session_leaves_the_shared_pool_intact() {
    let sim = PlcSimulator::spawn(behavior_with_assembly_data()).await;
    let manager = SessionManager::new(sim_config(&sim));

    // Two sessions against the same endpoint share one pool.
    let first = manager.open_session(None, None).await.unwrap().session_id;
    let second = manager.open_session(None, None).await.unwrap().session_id;
    assert!(manager.read_assembly(&first, 4, 1, 8).await.is_ok());
    assert!(manager.read_assembly(&second, 4, 1, 8).await.is_ok());

    let registrations_before = sim
        .events()
        .iter()
        .filter(|e| matches!(e, SimEvent::Registered { .. }))
        .count();
    assert_eq!(
        registrations_before, 1,
        "sequential sessions should share one pooled connection"
    );

    manager.close_session(&first).await.unwrap();

    // No teardown reaches the wire: the pool entry outlives the session.
    assert!(!sim
        .events()
        .iter()
        .any(|e| matches!(e, SimEvent::Unregistered { .. } | SimEvent::ForwardClose)));

    // The surviving session keeps the pooled connection; no fresh TCP
    // handshake or re-registration is paid for.
    let result = manager.read_assembly(&second, 4, 1, 8).await.unwrap();
    assert!(result.status.is_ok());
    let registrations_after = sim
        .events()
        .iter()
        .filter(|e| matches!(e, SimEvent::Registered { .. }))
        .count();
    assert_eq!(registrations_after, registrations_before);

    manager.close_session(&second).await.unwrap();
}

const DEVICE_XML: &str = r#"
    <Device>
      <Identity name="Test Rig" vendor="enip-link"/>
      <Assembly alias="Assembly_A" class_id="4" instance_id="100" direction="output" size="16">
        <Member name="Output1" offset="0" size="1"/>
      </Assembly>
      <Assembly alias="Sensors" class_id="4" instance_id="101" direction="input" size="4">
        <Member name="Level" offset="0" size="2"/>
      </Assembly>
    </Device>
"#;

#[tokio::test]
async fn alias_write_normalizes_and_members_decode() {
    let sim = PlcSimulator::spawn(SimBehavior::default()).await;
    let manager = SessionManager::new(sim_config(&sim));
    manager.put_configuration(DEVICE_XML).unwrap();
    assert_eq!(manager.get_configuration().as_deref(), Some(DEVICE_XML));

    let session_id = manager.open_session(None, None).await.unwrap().session_id;

    // 17 bytes of hex in, 16 bytes on the wire.
    let status = manager
        .write_assembly_by_alias(
            &session_id,
            "Assembly_A",
            "ff00000000000000000000000000000000",
        )
        .await
        .unwrap();
    assert!(status.is_ok());
    let stored = sim.attribute(4, 100, 3).unwrap();
    assert_eq!(stored.len(), 16);
    assert_eq!(stored[0], 0xFF);

    let view = manager
        .get_assembly_runtime(&session_id, "Assembly_A")
        .await
        .unwrap();
    assert_eq!(view.class_id, 4);
    assert_eq!(view.instance_id, 100);
    assert_eq!(&view.payload_hex[..2], "ff");
    let member = &view.members[0];
    assert_eq!(member.name, "Output1");
    assert_eq!(member.raw_hex, "ff");
    assert_eq!(member.int_value, Some(255));

    assert!(matches!(
        manager
            .write_assembly_by_alias(&session_id, "NoSuch", "00")
            .await,
        Err(EnipLinkError::UnknownAlias(_))
    ));
    assert!(matches!(
        manager
            .write_assembly_by_alias(&session_id, "Sensors", "0000")
            .await,
        Err(EnipLinkError::ConfigInvalid { .. })
    ));
    manager.close_session(&session_id).await.unwrap();
}

#[tokio::test]
async fn member_patch_reads_back_and_rewrites_whole_buffer() {
    let sim = PlcSimulator::spawn(SimBehavior::default()).await;
    let manager = SessionManager::new(sim_config(&sim));
    manager.put_configuration(DEVICE_XML).unwrap();
    let session_id = manager.open_session(None, None).await.unwrap().session_id;

    // Seed the assembly, then patch a single member.
    manager
        .write_assembly_by_alias(&session_id, "Assembly_A", &"11".repeat(16))
        .await
        .unwrap();
    let status = manager
        .write_assembly_member(&session_id, "Assembly_A", "Output1", "ff")
        .await
        .unwrap();
    assert!(status.is_ok());

    let stored = sim.attribute(4, 100, 3).unwrap();
    assert_eq!(stored.len(), 16);
    assert_eq!(stored[0], 0xFF);
    assert_eq!(stored[1], 0x11, "untargeted bytes must survive the patch");
    manager.close_session(&session_id).await.unwrap();
}

#[tokio::test]
async fn operations_on_one_session_complete_in_submission_order() {
    let sim = PlcSimulator::spawn(behavior_with_assembly_data()).await;
    let manager = SessionManager::new(sim_config(&sim));
    let session_id = manager.open_session(None, None).await.unwrap().session_id;

    let mut tasks = Vec::new();
    for i in 0u8..6 {
        let manager = manager.clone();
        let session_id = session_id.clone();
        tasks.push(tokio::spawn(async move {
            manager
                .write_assembly(&session_id, 4, 1, vec![i; 4])
                .await
                .unwrap();
        }));
        // Stagger submissions so arrival order is well defined.
        sleep(Duration::from_millis(25)).await;
    }
    for task in tasks {
        task.await.unwrap();
    }

    let writes: Vec<(u16, u8)> = sim
        .events()
        .into_iter()
        .filter_map(|e| match e {
            SimEvent::UnitRequest {
                sequence,
                service: 0x10,
                payload,
                ..
            } => Some((sequence, payload[0])),
            _ => None,
        })
        .collect();
    assert_eq!(writes.len(), 6);
    let payload_order: Vec<u8> = writes.iter().map(|(_, first)| *first).collect();
    assert_eq!(payload_order, vec![0, 1, 2, 3, 4, 5]);
    let mut sequences: Vec<u16> = writes.iter().map(|(seq, _)| *seq).collect();
    let sorted = {
        let mut s = sequences.clone();
        s.sort_unstable();
        s
    };
    assert_eq!(sequences, sorted, "Class 3 sequence counts must be monotonic");
    sequences.dedup();
    assert_eq!(sequences.len(), 6);
    manager.close_session(&session_id).await.unwrap();
}

#[tokio::test]
async fn unknown_session_is_rejected() {
    let sim = PlcSimulator::spawn(SimBehavior::default()).await;
    let manager = SessionManager::new(sim_config(&sim));
    assert!(matches!(
        manager.read_assembly("nope", 4, 1, 8).await,
        Err(EnipLinkError::UnknownSession(_))
    ));
}

#[tokio::test]
async fn routed_command_reaches_the_attribute_store() {
    let sim = PlcSimulator::spawn(behavior_with_assembly_data()).await;
    let manager = SessionManager::new(sim_config(&sim));
    let session_id = manager.open_session(None, None).await.unwrap().session_id;

    let result = manager
        .send_command(
            &session_id,
            0x0E,
            enip_link::CipPath::make_attribute(4, 1, 3),
            Vec::new(),
            enip_link::CommandTransport::RrRouted,
        )
        .await
        .unwrap();
    assert!(result.status.is_ok());
    assert_eq!(result.payload.len(), 8);
    manager.close_session(&session_id).await.unwrap();
}
