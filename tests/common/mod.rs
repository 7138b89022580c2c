// common/mod.rs - In-process PLC simulator for integration tests
//
// Speaks just enough ENIP/CIP to exercise the client: RegisterSession,
// Forward Open/Close, attribute get/set over both SendRRData and
// SendUnitData, NOP and ListServices. Behavior is mutable mid-test so
// individual scenarios can inject errors or drop the stream mid-reply.

#![allow(dead_code)]

use enip_link::codec::{
    encode_frame, item_type, register_session_body, service, CipReply, CipRequest, CpfItem,
    CpfPacket, EncapCommand, EncapHeader, ENCAP_HEADER_LEN,
};
use enip_link::status::CipStatus;
use enip_link::LinkConfig;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{sleep, Duration, Instant};

/// Tunable behavior of the simulated PLC.
#[derive(Debug, Clone)]
pub struct SimBehavior {
    /// First session handle handed out; subsequent registrations increment.
    pub session_handle_base: u32,
    pub o_t_connection_id: u32,
    pub t_o_connection_id: u32,
    /// Attribute store keyed by (class, instance, attribute).
    pub attributes: HashMap<(u16, u16, u16), Vec<u8>>,
    /// General status returned for Set_Attribute_Single.
    pub write_status: u8,
    /// General status returned for Forward Open.
    pub forward_open_status: u8,
    /// One-shot: close the stream after a partial reply to the next
    /// connected read.
    pub drop_before_reply: bool,
    /// Swallow ListServices probes instead of answering them.
    pub ignore_probes: bool,
}

impl Default for SimBehavior {
    fn default() -> Self {
        Self {
            session_handle_base: 0x0000_00AB,
            o_t_connection_id: 0x1122_3344,
            t_o_connection_id: 0x5566_7788,
            attributes: HashMap::new(),
            write_status: 0,
            forward_open_status: 0,
            drop_before_reply: false,
            ignore_probes: false,
        }
    }
}

/// Observable protocol events, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimEvent {
    Registered {
        handle: u32,
    },
    Unregistered {
        handle: u32,
    },
    ForwardOpen,
    ForwardClose,
    UnitRequest {
        sequence: u16,
        service: u8,
        class_id: u16,
        instance_id: u16,
        attribute_id: Option<u16>,
        payload: Vec<u8>,
    },
    RrRequest {
        service: u8,
    },
    Nop {
        data: Vec<u8>,
    },
    ListServices,
}

pub struct PlcSimulator {
    addr: SocketAddr,
    behavior: Arc<Mutex<SimBehavior>>,
    events: Arc<Mutex<Vec<SimEvent>>>,
    shutdown: watch::Sender<bool>,
}

impl PlcSimulator {
    pub async fn spawn(behavior: SimBehavior) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let behavior = Arc::new(Mutex::new(behavior));
        let events = Arc::new(Mutex::new(Vec::new()));
        let register_counter = Arc::new(AtomicU32::new(0));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let accept_behavior = Arc::clone(&behavior);
        let accept_events = Arc::clone(&events);
        let mut accept_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_shutdown.changed() => break,
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { break };
                        tokio::spawn(serve_conn(
                            stream,
                            Arc::clone(&accept_behavior),
                            Arc::clone(&accept_events),
                            Arc::clone(&register_counter),
                            shutdown_rx.clone(),
                        ));
                    }
                }
            }
        });

        Self {
            addr,
            behavior,
            events,
            shutdown,
        }
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn events(&self) -> Vec<SimEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn set<F: FnOnce(&mut SimBehavior)>(&self, mutate: F) {
        mutate(&mut self.behavior.lock().unwrap());
    }

    pub fn attribute(&self, class_id: u16, instance_id: u16, attribute_id: u16) -> Option<Vec<u8>> {
        self.behavior
            .lock()
            .unwrap()
            .attributes
            .get(&(class_id, instance_id, attribute_id))
            .cloned()
    }

    /// Stop accepting and drop every live connection.
    pub fn kill(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Poll until an event matching `pred` shows up or the deadline passes.
    pub async fn wait_for<F: Fn(&SimEvent) -> bool>(&self, pred: F, deadline: Duration) -> bool {
        let until = Instant::now() + deadline;
        loop {
            if self.events().iter().any(&pred) {
                return true;
            }
            if Instant::now() >= until {
                return false;
            }
            sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Client configuration pointed at the simulator, with test-friendly
/// timings.
pub fn sim_config(sim: &PlcSimulator) -> LinkConfig {
    let mut config = LinkConfig::default()
        .with_host(sim.host())
        .with_port(sim.port());
    // Keep the heartbeat out of the way unless a test opts in.
    config.heartbeat_interval = Duration::from_secs(60);
    config.read_timeout = Duration::from_secs(2);
    config.operation_deadline = Duration::from_secs(5);
    config
}

async fn serve_conn(
    mut stream: TcpStream,
    behavior: Arc<Mutex<SimBehavior>>,
    events: Arc<Mutex<Vec<SimEvent>>>,
    register_counter: Arc<AtomicU32>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let mut header_buf = [0u8; ENCAP_HEADER_LEN];
        tokio::select! {
            _ = shutdown.changed() => return,
            read = stream.read_exact(&mut header_buf) => {
                if read.is_err() {
                    return;
                }
            }
        }
        let Ok(header) = EncapHeader::decode(&header_buf) else {
            return;
        };
        let mut body = vec![0u8; header.length as usize];
        if !body.is_empty() && stream.read_exact(&mut body).await.is_err() {
            return;
        }

        match header.command {
            EncapCommand::RegisterSession => {
                let handle = {
                    let behavior = behavior.lock().unwrap();
                    behavior.session_handle_base + register_counter.fetch_add(1, Ordering::SeqCst)
                };
                events
                    .lock()
                    .unwrap()
                    .push(SimEvent::Registered { handle });
                let reply = encode_frame(
                    EncapCommand::RegisterSession,
                    handle,
                    &register_session_body(),
                );
                if stream.write_all(&reply).await.is_err() {
                    return;
                }
            }
            EncapCommand::UnregisterSession => {
                events.lock().unwrap().push(SimEvent::Unregistered {
                    handle: header.session_handle,
                });
            }
            EncapCommand::Nop => {
                events.lock().unwrap().push(SimEvent::Nop { data: body });
            }
            EncapCommand::ListServices => {
                events.lock().unwrap().push(SimEvent::ListServices);
                let ignore = behavior.lock().unwrap().ignore_probes;
                if !ignore {
                    let reply =
                        encode_frame(EncapCommand::ListServices, header.session_handle, &[]);
                    if stream.write_all(&reply).await.is_err() {
                        return;
                    }
                }
            }
            EncapCommand::SendRRData => {
                if handle_rr(&mut stream, &header, &body, &behavior, &events)
                    .await
                    .is_err()
                {
                    return;
                }
            }
            EncapCommand::SendUnitData => {
                if handle_unit(&mut stream, &header, &body, &behavior, &events)
                    .await
                    .is_err()
                {
                    return;
                }
            }
            EncapCommand::ListIdentity => {
                let reply = encode_frame(EncapCommand::ListIdentity, header.session_handle, &[]);
                if stream.write_all(&reply).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn handle_rr(
    stream: &mut TcpStream,
    header: &EncapHeader,
    body: &[u8],
    behavior: &Arc<Mutex<SimBehavior>>,
    events: &Arc<Mutex<Vec<SimEvent>>>,
) -> std::io::Result<()> {
    let Ok(packet) = CpfPacket::decode(body) else {
        return Ok(());
    };
    let Some(item) = packet.find(item_type::UNCONNECTED_DATA) else {
        return Ok(());
    };
    let Ok(mut request) = CipRequest::decode(&item.data) else {
        return Ok(());
    };

    // Unwrap one Unconnected Send hop; on success the embedded reply is
    // returned directly, like a real target does.
    if request.service == service::UNCONNECTED_SEND {
        let data = &request.data;
        if data.len() >= 4 {
            let embedded_len = u16::from_le_bytes([data[2], data[3]]) as usize;
            if data.len() >= 4 + embedded_len {
                if let Ok(inner) = CipRequest::decode(&data[4..4 + embedded_len]) {
                    request = inner;
                }
            }
        }
    }

    events.lock().unwrap().push(SimEvent::RrRequest {
        service: request.service,
    });

    let reply = match request.service {
        service::FORWARD_OPEN => {
            events.lock().unwrap().push(SimEvent::ForwardOpen);
            let behavior = behavior.lock().unwrap();
            if behavior.forward_open_status != 0 {
                CipReply::with_status(
                    service::FORWARD_OPEN,
                    CipStatus::from_general(behavior.forward_open_status),
                    Vec::new(),
                )
            } else {
                // o_t id, t_o id, serial/vendor/originator echo, both APIs,
                // no application reply data.
                let mut data = Vec::with_capacity(26);
                data.extend_from_slice(&behavior.o_t_connection_id.to_le_bytes());
                data.extend_from_slice(&behavior.t_o_connection_id.to_le_bytes());
                if request.data.len() >= 18 {
                    data.extend_from_slice(&request.data[10..18]);
                } else {
                    data.extend_from_slice(&[0u8; 8]);
                }
                data.extend_from_slice(&100_000u32.to_le_bytes());
                data.extend_from_slice(&100_000u32.to_le_bytes());
                data.push(0x00);
                data.push(0x00);
                CipReply::success(service::FORWARD_OPEN, data)
            }
        }
        service::FORWARD_CLOSE => {
            events.lock().unwrap().push(SimEvent::ForwardClose);
            let mut data = Vec::with_capacity(10);
            if request.data.len() >= 10 {
                data.extend_from_slice(&request.data[2..10]);
            } else {
                data.extend_from_slice(&[0u8; 8]);
            }
            data.push(0x00);
            data.push(0x00);
            CipReply::success(service::FORWARD_CLOSE, data)
        }
        other => attribute_reply(other, &request, behavior),
    };

    let reply_body = CpfPacket::new(vec![
        CpfItem::null_address(),
        CpfItem::unconnected_data(reply.encode()),
    ])
    .encode();
    let frame = encode_frame(
        EncapCommand::SendRRData,
        header.session_handle,
        &reply_body,
    );
    stream.write_all(&frame).await
}

async fn handle_unit(
    stream: &mut TcpStream,
    header: &EncapHeader,
    body: &[u8],
    behavior: &Arc<Mutex<SimBehavior>>,
    events: &Arc<Mutex<Vec<SimEvent>>>,
) -> std::io::Result<()> {
    let Ok(packet) = CpfPacket::decode(body) else {
        return Ok(());
    };
    let Some(item) = packet.find(item_type::CONNECTION_DATA) else {
        return Ok(());
    };
    if item.data.len() < 2 {
        return Ok(());
    }
    let sequence = u16::from_le_bytes([item.data[0], item.data[1]]);
    let Ok(request) = CipRequest::decode(&item.data[2..]) else {
        return Ok(());
    };

    events.lock().unwrap().push(SimEvent::UnitRequest {
        sequence,
        service: request.service,
        class_id: request.path.class_id().unwrap_or(0),
        instance_id: request.path.instance_id().unwrap_or(0),
        attribute_id: request.path.attribute_id(),
        payload: request.data.clone(),
    });

    let drop_now = {
        let mut behavior = behavior.lock().unwrap();
        if behavior.drop_before_reply {
            behavior.drop_before_reply = false;
            true
        } else {
            false
        }
    };
    if drop_now {
        // Partial header, then a hard close: the client sees a truncated
        // reply and must mark the connection broken.
        let _ = stream.write_all(&[0x70, 0x00, 0xFF]).await;
        let _ = stream.shutdown().await;
        return Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionAborted,
            "simulated mid-reply drop",
        ));
    }

    let reply = attribute_reply(request.service, &request, behavior);
    let t_o_id = behavior.lock().unwrap().t_o_connection_id;
    let reply_body = CpfPacket::new(vec![
        CpfItem::connected_address(t_o_id),
        CpfItem::connection_data(sequence, &reply.encode()),
    ])
    .encode();
    let frame = encode_frame(
        EncapCommand::SendUnitData,
        header.session_handle,
        &reply_body,
    );
    stream.write_all(&frame).await
}

fn attribute_reply(
    service_code: u8,
    request: &CipRequest,
    behavior: &Arc<Mutex<SimBehavior>>,
) -> CipReply {
    let key = (
        request.path.class_id().unwrap_or(0),
        request.path.instance_id().unwrap_or(0),
        request.path.attribute_id().unwrap_or(0),
    );
    let mut behavior = behavior.lock().unwrap();
    match service_code {
        service::GET_ATTRIBUTE_SINGLE => {
            let data = behavior.attributes.get(&key).cloned();
            match data {
                Some(data) => CipReply::success(service_code, data),
                None => CipReply::with_status(
                    service_code,
                    CipStatus::from_general(0x16), // object does not exist
                    Vec::new(),
                ),
            }
        }
        service::SET_ATTRIBUTE_SINGLE => {
            let status = CipStatus::from_general(behavior.write_status);
            if status.is_ok() {
                behavior.attributes.insert(key, request.data.clone());
            }
            CipReply::with_status(service_code, status, Vec::new())
        }
        other => CipReply::with_status(
            other,
            CipStatus::from_general(0x08), // service not supported
            Vec::new(),
        ),
    }
}
