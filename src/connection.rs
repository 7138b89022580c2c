// connection.rs - One TCP socket to a PLC and its ENIP/CIP state machine
//
// A `Connection` owns a single socket and carries the protocol state the
// encapsulation and CIP layers hang off it: the ENIP session handle from
// RegisterSession, the pair of Class 3 connection ids from Forward Open,
// and the 16-bit sequence counter for connected exchanges. Exactly one
// request/response exchange is in flight at a time.

use crate::codec::{
    self, build_cip_frame, encode_frame, item_type, service, CipReply, CipRequest, CpfPacket,
    EncapCommand, EncapHeader, TransportSelect, ENCAP_HEADER_LEN,
};
use crate::config::Endpoint;
use crate::epath::CipPath;
use crate::error::{EnipLinkError, Result};
use crate::status::CipStatus;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration, Instant};
use tracing::{debug, info, warn};

/// Lifecycle of a connection.
///
/// `Closed -> Registered -> Connected -> Closed`; `Broken` is a terminal
/// marker that tells the pool to discard and replace the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Registered,
    Connected,
    Broken,
}

/// Forward Open parameter block for Class 3 explicit messaging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardOpenParams {
    /// Requested packet interval in microseconds, both directions.
    pub rpi_us: u32,
    /// Connection timeout multiplier code.
    pub timeout_multiplier: u8,
    pub originator_vendor_id: u16,
    pub originator_serial: u32,
    /// Connection size in bytes, both directions.
    pub connection_size: u16,
    /// 0x00 low, 0x01 high, 0x02 scheduled, 0x03 urgent.
    pub priority: u8,
    /// 0x02 point-to-point, 0x01 multicast.
    pub connection_type: u8,
    /// Route to the message router: port segment then logical path.
    pub route_path: Vec<u8>,
}

impl Default for ForwardOpenParams {
    fn default() -> Self {
        Self {
            rpi_us: 100_000,
            timeout_multiplier: 0x05,
            originator_vendor_id: 0x1337,
            originator_serial: 0x12345678,
            connection_size: 500,
            priority: 0x01,
            connection_type: 0x02,
            // Backplane port 1, slot 0, then Message Router class 2 instance 1.
            route_path: vec![0x01, 0x00, 0x20, 0x02, 0x24, 0x01],
        }
    }
}

impl ForwardOpenParams {
    /// Network connection parameters word: size, variable-size flag,
    /// priority, connection type.
    fn network_params_word(&self) -> u16 {
        (self.connection_size & 0x01FF)
            | ((self.priority as u16 & 0x03) << 10)
            | ((self.connection_type as u16 & 0x03) << 13)
    }
}

/// Transport class 3, server class, application-triggered.
const TRANSPORT_CLASS_TRIGGER: u8 = 0xA3;

/// A single ENIP/CIP connection to one PLC endpoint.
#[derive(Debug)]
pub struct Connection {
    endpoint: Endpoint,
    stream: Option<TcpStream>,
    state: ConnectionState,
    session_handle: u32,
    o_t_connection_id: u32,
    t_o_connection_id: u32,
    connection_serial: u16,
    sequence_count: u16,
    read_timeout: Duration,
    last_activity: Instant,
    params: ForwardOpenParams,
}

impl Connection {
    pub fn new(endpoint: Endpoint, read_timeout: Duration) -> Self {
        Self {
            endpoint,
            stream: None,
            state: ConnectionState::Closed,
            session_handle: 0,
            o_t_connection_id: 0,
            t_o_connection_id: 0,
            connection_serial: 0,
            sequence_count: 0,
            read_timeout,
            last_activity: Instant::now(),
            params: ForwardOpenParams::default(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn session_handle(&self) -> u32 {
        self.session_handle
    }

    pub fn o_t_connection_id(&self) -> u32 {
        self.o_t_connection_id
    }

    pub fn t_o_connection_id(&self) -> u32 {
        self.t_o_connection_id
    }

    pub fn sequence_count(&self) -> u16 {
        self.sequence_count
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Demote the connection so the pool replaces it.
    pub fn mark_broken(&mut self) {
        self.state = ConnectionState::Broken;
    }

    /// Establish TCP and register the ENIP session.
    /// Transitions `Closed -> Registered`.
    pub async fn open(&mut self) -> Result<()> {
        let addr = self.endpoint.addr();
        let stream = match timeout(self.read_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                return Err(EnipLinkError::transport_io(
                    format!("TCP connect to {addr} failed"),
                    err,
                ))
            }
            Err(_) => {
                return Err(EnipLinkError::transport(format!(
                    "TCP connect to {addr} timed out"
                )))
            }
        };
        self.stream = Some(stream);
        self.state = ConnectionState::Closed;

        let frame = encode_frame(
            EncapCommand::RegisterSession,
            0,
            &codec::register_session_body(),
        );
        let deadline = Instant::now() + self.read_timeout;
        self.write_frame(&frame, deadline).await?;
        let (header, _body) = self.read_frame(deadline).await?;
        if header.command != EncapCommand::RegisterSession {
            self.state = ConnectionState::Broken;
            return Err(EnipLinkError::malformed(format!(
                "expected RegisterSession reply, got {:?}",
                header.command
            )));
        }
        if header.status != 0 || header.session_handle == 0 {
            self.stream = None;
            self.state = ConnectionState::Closed;
            return Err(EnipLinkError::RegisterFailed {
                status: header.status,
            });
        }
        self.session_handle = header.session_handle;
        self.state = ConnectionState::Registered;
        info!(
            endpoint = %self.endpoint,
            session_handle = %format!("0x{:08X}", self.session_handle),
            "ENIP session registered"
        );
        Ok(())
    }

    /// Open the Class 3 explicit-messaging connection via Forward Open.
    /// Transitions `Registered -> Connected`.
    pub async fn connect(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Registered => {}
            other => {
                return Err(EnipLinkError::transport(format!(
                    "Forward Open requires a Registered connection, state is {other:?}"
                )))
            }
        }

        let (serial, t_o_request): (u16, u32) = {
            let mut rng = rand::thread_rng();
            (rng.gen(), rng.gen())
        };
        let body = self.forward_open_body(serial, t_o_request);
        let request = CipRequest::new(service::FORWARD_OPEN, CipPath::make(0x06, 0x01), body);
        let reply = self
            .exchange_rr(&request, TransportSelect::Unconnected, true)
            .await?;
        if !reply.status.is_ok() {
            warn!(endpoint = %self.endpoint, status = %reply.status, "Forward Open refused");
            return Err(EnipLinkError::Cip {
                status: reply.status,
            });
        }
        if reply.data.len() < 10 {
            self.state = ConnectionState::Broken;
            return Err(EnipLinkError::malformed(
                "Forward Open reply shorter than the fixed parameter block",
            ));
        }
        self.o_t_connection_id =
            u32::from_le_bytes([reply.data[0], reply.data[1], reply.data[2], reply.data[3]]);
        self.t_o_connection_id =
            u32::from_le_bytes([reply.data[4], reply.data[5], reply.data[6], reply.data[7]]);
        self.connection_serial = serial;
        self.sequence_count = 0;
        self.state = ConnectionState::Connected;
        info!(
            endpoint = %self.endpoint,
            o_t = %format!("0x{:08X}", self.o_t_connection_id),
            t_o = %format!("0x{:08X}", self.t_o_connection_id),
            "Class 3 connection open"
        );
        Ok(())
    }

    /// One unconnected request/response exchange via SendRRData. With
    /// `routed` the CIP request is wrapped in an Unconnected Send hop.
    pub async fn request_rr(
        &mut self,
        service_code: u8,
        path: CipPath,
        payload: Vec<u8>,
        routed: bool,
        deadline: Instant,
    ) -> Result<(CipStatus, Vec<u8>)> {
        if !matches!(
            self.state,
            ConnectionState::Registered | ConnectionState::Connected
        ) {
            return Err(EnipLinkError::transport(format!(
                "unconnected exchange requires a registered session, state is {:?}",
                self.state
            )));
        }
        let request = CipRequest::new(service_code, path, payload);
        let transport = if routed {
            TransportSelect::UnconnectedSend
        } else {
            TransportSelect::Unconnected
        };
        let frame = build_cip_frame(self.session_handle, &request, &transport)?;
        let (header, body) = self.exchange_frame(&frame, deadline, false).await?;
        if header.command != EncapCommand::SendRRData {
            self.state = ConnectionState::Broken;
            return Err(EnipLinkError::malformed(format!(
                "expected SendRRData reply, got {:?}",
                header.command
            )));
        }
        let reply = self.decode_reply_item(&body, item_type::UNCONNECTED_DATA, 0)?;
        self.last_activity = Instant::now();
        Ok((reply.status, reply.data))
    }

    /// One connected Class 3 exchange via SendUnitData. The sequence count
    /// is pre-incremented, so the first request after Forward Open carries 1.
    pub async fn request_unit(
        &mut self,
        service_code: u8,
        path: CipPath,
        payload: Vec<u8>,
        deadline: Instant,
    ) -> Result<(CipStatus, Vec<u8>)> {
        if self.state != ConnectionState::Connected {
            return Err(EnipLinkError::transport(format!(
                "Class 3 exchange requires a Connected connection, state is {:?}",
                self.state
            )));
        }
        let sequence = self.sequence_count.wrapping_add(1);
        self.sequence_count = sequence;

        let request = CipRequest::new(service_code, path, payload);
        let frame = build_cip_frame(
            self.session_handle,
            &request,
            &TransportSelect::Connected {
                connection_id: self.o_t_connection_id,
                sequence,
            },
        )?;
        let (header, body) = self.exchange_frame(&frame, deadline, false).await?;
        if header.command != EncapCommand::SendUnitData {
            self.state = ConnectionState::Broken;
            return Err(EnipLinkError::malformed(format!(
                "expected SendUnitData reply, got {:?}",
                header.command
            )));
        }
        let reply = self.decode_reply_item(&body, item_type::CONNECTION_DATA, 2)?;
        self.last_activity = Instant::now();
        Ok((reply.status, reply.data))
    }

    /// Send the ENIP NOP heartbeat carrying the opaque keep-alive pattern.
    /// The receiver discards it; no reply is read.
    pub async fn send_nop(&mut self, pattern: &[u8]) -> Result<()> {
        let frame = encode_frame(EncapCommand::Nop, self.session_handle, pattern);
        let deadline = Instant::now() + self.read_timeout;
        self.write_frame(&frame, deadline).await?;
        self.last_activity = Instant::now();
        Ok(())
    }

    /// ListServices request/reply used as the keep-alive probe once a Class 3
    /// connection exists, so a stalled peer trips the read deadline.
    pub async fn probe_services(&mut self, deadline: Instant) -> Result<()> {
        let frame = encode_frame(EncapCommand::ListServices, self.session_handle, &[]);
        let (header, _body) = self.exchange_frame(&frame, deadline, false).await?;
        if header.command != EncapCommand::ListServices {
            self.state = ConnectionState::Broken;
            return Err(EnipLinkError::malformed(format!(
                "expected ListServices reply, got {:?}",
                header.command
            )));
        }
        self.last_activity = Instant::now();
        Ok(())
    }

    /// Tear the connection down: Forward Close when Connected, then
    /// UnregisterSession when Registered, then close the socket.
    ///
    /// The state ends `Closed` even on failure; teardown errors are logged
    /// and swallowed except for the first, which is returned.
    pub async fn close(&mut self) -> Result<()> {
        let mut first_err: Option<EnipLinkError> = None;

        if self.state == ConnectionState::Connected {
            if let Err(err) = self.forward_close().await {
                warn!(endpoint = %self.endpoint, error = %err, "Forward Close failed during teardown");
                first_err.get_or_insert(err);
            }
        }

        if matches!(
            self.state,
            ConnectionState::Registered | ConnectionState::Connected
        ) && self.stream.is_some()
        {
            let frame = encode_frame(EncapCommand::UnregisterSession, self.session_handle, &[]);
            let deadline = Instant::now() + self.read_timeout;
            if let Err(err) = self.write_frame(&frame, deadline).await {
                warn!(endpoint = %self.endpoint, error = %err, "UnregisterSession failed during teardown");
                first_err.get_or_insert(err);
            }
        }

        self.stream = None;
        self.state = ConnectionState::Closed;
        self.session_handle = 0;
        self.o_t_connection_id = 0;
        self.t_o_connection_id = 0;
        self.sequence_count = 0;
        debug!(endpoint = %self.endpoint, "connection closed");

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn forward_close(&mut self) -> Result<()> {
        let mut body = Vec::with_capacity(12 + self.params.route_path.len());
        body.push(0x07); // priority / time tick
        body.push(0x0A); // timeout ticks
        body.extend_from_slice(&self.connection_serial.to_le_bytes());
        body.extend_from_slice(&self.params.originator_vendor_id.to_le_bytes());
        body.extend_from_slice(&self.params.originator_serial.to_le_bytes());
        body.push((self.params.route_path.len() / 2) as u8);
        body.push(0x00); // reserved
        body.extend_from_slice(&self.params.route_path);

        let request = CipRequest::new(service::FORWARD_CLOSE, CipPath::make(0x06, 0x01), body);
        let reply = self
            .exchange_rr(&request, TransportSelect::Unconnected, true)
            .await?;
        self.state = ConnectionState::Registered;
        if !reply.status.is_ok() {
            return Err(EnipLinkError::Cip {
                status: reply.status,
            });
        }
        Ok(())
    }

    fn forward_open_body(&self, serial: u16, t_o_request: u32) -> Vec<u8> {
        let params_word = self.params.network_params_word();
        let mut body = Vec::with_capacity(36 + self.params.route_path.len());
        body.push(0x07); // priority / time tick
        body.push(0x0A); // timeout ticks
        body.extend_from_slice(&0u32.to_le_bytes()); // O->T id, target assigns
        body.extend_from_slice(&t_o_request.to_le_bytes()); // T->O id we propose
        body.extend_from_slice(&serial.to_le_bytes());
        body.extend_from_slice(&self.params.originator_vendor_id.to_le_bytes());
        body.extend_from_slice(&self.params.originator_serial.to_le_bytes());
        body.push(self.params.timeout_multiplier);
        body.extend_from_slice(&[0x00, 0x00, 0x00]); // reserved
        body.extend_from_slice(&self.params.rpi_us.to_le_bytes());
        body.extend_from_slice(&params_word.to_le_bytes());
        body.extend_from_slice(&self.params.rpi_us.to_le_bytes());
        body.extend_from_slice(&params_word.to_le_bytes());
        body.push(TRANSPORT_CLASS_TRIGGER);
        body.push((self.params.route_path.len() / 2) as u8);
        body.extend_from_slice(&self.params.route_path);
        body
    }

    /// Exchange used by the transport-critical Connection Manager services:
    /// an encapsulation error here demotes the connection.
    async fn exchange_rr(
        &mut self,
        request: &CipRequest,
        transport: TransportSelect,
        critical: bool,
    ) -> Result<CipReply> {
        let frame = build_cip_frame(self.session_handle, request, &transport)?;
        let deadline = Instant::now() + self.read_timeout;
        let (header, body) = self.exchange_frame(&frame, deadline, critical).await?;
        if header.command != EncapCommand::SendRRData {
            self.state = ConnectionState::Broken;
            return Err(EnipLinkError::malformed(format!(
                "expected SendRRData reply, got {:?}",
                header.command
            )));
        }
        self.decode_reply_item(&body, item_type::UNCONNECTED_DATA, 0)
    }

    fn decode_reply_item(
        &mut self,
        body: &[u8],
        wanted_type: u16,
        prefix_len: usize,
    ) -> Result<CipReply> {
        let packet = match CpfPacket::decode(body) {
            Ok(packet) => packet,
            Err(err) => {
                self.state = ConnectionState::Broken;
                return Err(err);
            }
        };
        let item = match packet.find(wanted_type) {
            Some(item) if item.data.len() >= prefix_len => item,
            _ => {
                self.state = ConnectionState::Broken;
                return Err(EnipLinkError::malformed(format!(
                    "reply is missing CPF item 0x{wanted_type:04X}"
                )));
            }
        };
        match CipReply::decode(&item.data[prefix_len..]) {
            Ok(reply) => Ok(reply),
            Err(err) => {
                self.state = ConnectionState::Broken;
                Err(err)
            }
        }
    }

    async fn exchange_frame(
        &mut self,
        frame: &[u8],
        deadline: Instant,
        critical: bool,
    ) -> Result<(EncapHeader, Vec<u8>)> {
        self.write_frame(frame, deadline).await?;
        let (header, body) = self.read_frame(deadline).await?;
        if header.status != 0 {
            if critical {
                self.state = ConnectionState::Broken;
            }
            return Err(EnipLinkError::EnipProtocol {
                status: header.status,
            });
        }
        Ok((header, body))
    }

    async fn write_frame(&mut self, frame: &[u8], deadline: Instant) -> Result<()> {
        let wait = self.io_wait(deadline)?;
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return Err(EnipLinkError::transport("connection has no open socket")),
        };
        let written = timeout(wait, stream.write_all(frame)).await;
        match written {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                self.state = ConnectionState::Broken;
                Err(EnipLinkError::transport_io("socket write failed", err))
            }
            Err(_) => {
                self.state = ConnectionState::Broken;
                self.timeout_error(deadline)
            }
        }
    }

    /// Length-prefixed read: the 24-byte header first, then exactly the
    /// declared number of body bytes. A partial read that cannot complete in
    /// time demotes the connection.
    async fn read_frame(&mut self, deadline: Instant) -> Result<(EncapHeader, Vec<u8>)> {
        let mut raw_header = [0u8; ENCAP_HEADER_LEN];
        self.read_exact_deadline(&mut raw_header, deadline, "ENIP header")
            .await?;
        let header = match EncapHeader::decode(&raw_header) {
            Ok(header) => header,
            Err(err) => {
                self.state = ConnectionState::Broken;
                return Err(err);
            }
        };
        let mut body = vec![0u8; header.length as usize];
        if !body.is_empty() {
            self.read_exact_deadline(&mut body, deadline, "ENIP payload")
                .await?;
        }
        debug!(
            endpoint = %self.endpoint,
            command = ?header.command,
            length = header.length,
            "received frame"
        );
        Ok((header, body))
    }

    async fn read_exact_deadline(
        &mut self,
        buf: &mut [u8],
        deadline: Instant,
        context: &str,
    ) -> Result<()> {
        let wait = self.io_wait(deadline)?;
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return Err(EnipLinkError::transport("connection has no open socket")),
        };
        let read = timeout(wait, stream.read_exact(buf)).await;
        match read {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => {
                self.state = ConnectionState::Broken;
                Err(EnipLinkError::transport_io(
                    format!("socket closed while reading {context}"),
                    err,
                ))
            }
            Err(_) => {
                self.state = ConnectionState::Broken;
                self.timeout_error(deadline)
            }
        }
    }

    /// Time available for the next socket wait: the read timeout, shortened
    /// by the operation deadline.
    fn io_wait(&mut self, deadline: Instant) -> Result<Duration> {
        let now = Instant::now();
        if now >= deadline {
            self.state = ConnectionState::Broken;
            return Err(EnipLinkError::Cancelled);
        }
        Ok(self.read_timeout.min(deadline - now))
    }

    fn timeout_error<T>(&self, deadline: Instant) -> Result<T> {
        if Instant::now() >= deadline {
            Err(EnipLinkError::Cancelled)
        } else {
            Err(EnipLinkError::transport(format!(
                "no reply from {} within {:?}",
                self.endpoint, self.read_timeout
            )))
        }
    }
}
