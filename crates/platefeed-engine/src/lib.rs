use std::env;
use std::fs;
use std::io;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use platefeed_contracts::error::ClientError;
use platefeed_contracts::feed::{truncate_car_identifier, EntryOrigin, FeedEntryDraft, FeedStore};
use platefeed_contracts::journal::{Journal, JournalPayload};
use platefeed_contracts::wire::{decode_push_frame, identifier_message, now_utc_iso, Ack};
use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tungstenite::client::IntoClientRequest;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{connect as websocket_connect, Message as WsMessage, WebSocket};

const HTTP_TIMEOUT_SECS_DEFAULT: u64 = 30;
const WS_READ_TIMEOUT_MS_DEFAULT: u64 = 500;
const ERROR_BODY_MAX_CHARS: usize = 256;

type WsStream = WebSocket<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub http_base: String,
    pub ws_base: String,
    pub image_base: String,
    pub device_id: String,
}

impl ClientConfig {
    pub fn new(server: &str, device_id: &str) -> Self {
        let http_base = server.trim().trim_end_matches('/').to_string();
        Self {
            ws_base: ws_base_from_http(&http_base),
            image_base: format!("{http_base}/images"),
            http_base,
            device_id: device_id.trim().to_string(),
        }
    }

    pub fn with_ws_base(mut self, ws_base: &str) -> Self {
        self.ws_base = ws_base.trim().trim_end_matches('/').to_string();
        self
    }

    pub fn with_image_base(mut self, image_base: &str) -> Self {
        self.image_base = image_base.trim().trim_end_matches('/').to_string();
        self
    }

    pub fn push_endpoint(&self) -> String {
        format!("{}/ws/{}", self.ws_base, self.device_id)
    }

    pub fn upload_endpoint(&self) -> String {
        format!("{}/upload", self.http_base)
    }

    pub fn message_endpoint(&self) -> String {
        format!("{}/message", self.http_base)
    }
}

fn ws_base_from_http(http_base: &str) -> String {
    if let Some(rest) = http_base.strip_prefix("https://") {
        return format!("wss://{rest}");
    }
    if let Some(rest) = http_base.strip_prefix("http://") {
        return format!("ws://{rest}");
    }
    http_base.to_string()
}

/// Image references in feed entries are opaque; resolving one to a
/// displayable URL is the rendering collaborator's job, done by
/// concatenation with the configured base.
pub fn resolve_image_url(config: &ClientConfig, image_ref: &str) -> String {
    format!(
        "{}/{}",
        config.image_base.trim_end_matches('/'),
        image_ref.trim_start_matches('/')
    )
}

fn http_timeout() -> Duration {
    let secs = env::var("PLATEFEED_HTTP_TIMEOUT_SECS")
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .map(|value| value.clamp(1, 300))
        .unwrap_or(HTTP_TIMEOUT_SECS_DEFAULT);
    Duration::from_secs(secs)
}

fn ws_read_timeout() -> Duration {
    let ms = env::var("PLATEFEED_WS_READ_TIMEOUT_MS")
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .map(|value| value.clamp(50, 5000))
        .unwrap_or(WS_READ_TIMEOUT_MS_DEFAULT);
    Duration::from_millis(ms)
}

/// Everything that mutates the feed travels through one queue of these,
/// consumed by a single [`SyncSession`] dispatcher. Producers are the
/// connection reader thread and the capture coordinator's local echoes.
#[derive(Debug)]
pub enum FeedSignal {
    Opened,
    Entry(FeedEntryDraft),
    Protocol(ClientError),
    Closed(Option<String>),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChannelState {
    Idle,
    Open,
    Closed,
}

impl ChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelState::Idle => "idle",
            ChannelState::Open => "open",
            ChannelState::Closed => "closed",
        }
    }
}

/// Single consumer of the signal queue; exclusively owns the [`FeedStore`].
/// Signals are applied strictly in arrival order, which is what makes the
/// lock-free store safe.
pub struct SyncSession {
    store: FeedStore,
    rx: Receiver<FeedSignal>,
    journal: Journal,
    state: ChannelState,
}

impl SyncSession {
    pub fn new(journal: Journal) -> (Self, Sender<FeedSignal>) {
        let (tx, rx) = mpsc::channel();
        (
            Self {
                store: FeedStore::new(),
                rx,
                journal,
                state: ChannelState::Idle,
            },
            tx,
        )
    }

    /// Drains every currently queued signal; returns how many were handled.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(signal) = self.rx.try_recv() {
            self.process(signal);
            handled += 1;
        }
        handled
    }

    /// Blocks up to `timeout` for the first signal, then drains the rest.
    pub fn pump_wait(&mut self, timeout: Duration) -> usize {
        match self.rx.recv_timeout(timeout) {
            Ok(signal) => {
                self.process(signal);
                1 + self.pump()
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => 0,
        }
    }

    fn process(&mut self, signal: FeedSignal) {
        match signal {
            FeedSignal::Opened => {
                self.state = ChannelState::Open;
                let _ = self.journal.emit("channel_opened", JournalPayload::new());
            }
            FeedSignal::Entry(draft) => {
                let origin = draft.origin;
                let key = self.store.append(draft);
                let _ = self.journal.emit(
                    "entry_appended",
                    map_object(json!({
                        "sequence_key": key,
                        "origin": origin.as_str(),
                    })),
                );
            }
            FeedSignal::Protocol(err) => {
                // Malformed payloads never touch the feed and never kill
                // the channel; they get their own journal event type.
                let _ = self.journal.emit(
                    "protocol_error",
                    map_object(json!({ "message": err.message() })),
                );
            }
            FeedSignal::Closed(reason) => {
                self.state = ChannelState::Closed;
                let _ = self
                    .journal
                    .emit("channel_closed", map_object(json!({ "reason": reason })));
            }
        }
    }

    pub fn store(&self) -> &FeedStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut FeedStore {
        &mut self.store
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }
}

/// Owns the lifetime of the single push-channel connection. No automatic
/// reconnection: a transport failure surfaces as a `Closed` signal and the
/// caller decides whether to call [`ConnectionManager::open`] again.
pub struct ConnectionManager {
    config: ClientConfig,
    tx: Sender<FeedSignal>,
    stop_flag: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    pub fn new(config: ClientConfig, tx: Sender<FeedSignal>) -> Self {
        Self {
            config,
            tx,
            stop_flag: Arc::new(AtomicBool::new(false)),
            reader: None,
        }
    }

    /// Connects the per-device endpoint and starts the reader thread. Any
    /// previous channel is torn down first so reopening never leaks.
    pub fn open(&mut self) -> Result<(), ClientError> {
        self.close();

        let endpoint = self.config.push_endpoint();
        let request = endpoint
            .as_str()
            .into_client_request()
            .map_err(|err| ClientError::transport(format!("invalid push endpoint: {err}")))?;
        let (mut ws, _) = websocket_connect(request).map_err(|err| {
            ClientError::transport(format!("failed to connect push channel ({endpoint}): {err}"))
        })?;
        set_socket_read_timeout(&mut ws, Some(ws_read_timeout()));

        let _ = self.tx.send(FeedSignal::Opened);

        let stop_flag = Arc::new(AtomicBool::new(false));
        self.stop_flag = Arc::clone(&stop_flag);
        let tx = self.tx.clone();
        let device_id = self.config.device_id.clone();
        self.reader = Some(thread::spawn(move || {
            read_push_channel(ws, tx, device_id, stop_flag);
        }));
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.reader
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Idempotent; joins the reader so the socket is released before
    /// returning. The `Closed` signal comes from the reader itself, once
    /// per channel lifetime.
    pub fn close(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_push_channel(
    mut ws: WsStream,
    tx: Sender<FeedSignal>,
    device_id: String,
    stop_flag: Arc<AtomicBool>,
) {
    let reason = loop {
        if stop_flag.load(Ordering::SeqCst) {
            break None;
        }

        let message = match ws.read() {
            Ok(message) => message,
            Err(tungstenite::Error::Io(err))
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                continue;
            }
            Err(err) => {
                let label = if is_tungstenite_transport_error(&err) {
                    "push channel transport failure"
                } else {
                    "push channel read failed"
                };
                break Some(format!("{label}: {err}"));
            }
        };

        let raw = match message {
            WsMessage::Text(text) => text.to_string(),
            WsMessage::Binary(bytes) => String::from_utf8_lossy(&bytes).to_string(),
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            WsMessage::Close(_) => break Some("push channel closed by server".to_string()),
            _ => continue,
        };

        match decode_push_frame(&raw, &device_id) {
            Ok(draft) => {
                let _ = tx.send(FeedSignal::Entry(draft));
            }
            Err(err) => {
                let _ = tx.send(FeedSignal::Protocol(err));
            }
        }
    };

    let _ = ws.close(None);
    let _ = tx.send(FeedSignal::Closed(reason));
}

fn set_socket_read_timeout(ws: &mut WsStream, timeout: Option<Duration>) {
    match ws.get_mut() {
        MaybeTlsStream::Plain(stream) => {
            let _ = stream.set_read_timeout(timeout);
        }
        MaybeTlsStream::Rustls(stream) => {
            let _ = stream.get_mut().set_read_timeout(timeout);
        }
        _ => {}
    }
}

fn is_tungstenite_transport_error(err: &tungstenite::Error) -> bool {
    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => true,
        tungstenite::Error::Io(io_err) => is_transport_io_error_kind(io_err.kind()),
        tungstenite::Error::Tls(_) => true,
        _ => false,
    }
}

fn is_transport_io_error_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
    )
}

/// A locally staged photo: source path, loaded bytes, content fingerprint.
#[derive(Debug, Clone)]
pub struct StagedImage {
    pub path: PathBuf,
    pub bytes: Vec<u8>,
    pub fingerprint: String,
}

impl StagedImage {
    pub fn from_bytes(path: impl Into<PathBuf>, bytes: Vec<u8>) -> Self {
        let fingerprint = image_fingerprint(&bytes);
        Self {
            path: path.into(),
            bytes,
            fingerprint,
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, ClientError> {
        let bytes = fs::read(path).map_err(|err| {
            ClientError::validation(format!("failed to read image {}: {err}", path.display()))
        })?;
        if bytes.is_empty() {
            return Err(ClientError::validation(format!(
                "image {} is empty",
                path.display()
            )));
        }
        Ok(Self::from_bytes(path, bytes))
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .unwrap_or_else(|| "capture.jpg".to_string())
    }

    pub fn short_fingerprint(&self) -> String {
        self.fingerprint.chars().take(12).collect()
    }
}

fn image_fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// The two write actions, behind a seam so tests and `--dry-run` can swap
/// the HTTP client out. One attempt per call, no retry, no state mutation
/// beyond the network exchange itself.
pub trait ActionTransport {
    fn submit_image(
        &self,
        image: &StagedImage,
        car_identifier: Option<&str>,
    ) -> Result<Ack, ClientError>;

    fn submit_identifier(&self, identifier: &str) -> Result<Ack, ClientError>;
}

pub struct HttpActionClient {
    config: ClientConfig,
    http: HttpClient,
}

impl HttpActionClient {
    pub fn new(config: ClientConfig) -> Self {
        let http = HttpClient::builder()
            .timeout(http_timeout())
            .build()
            .unwrap_or_else(|_| HttpClient::new());
        Self { config, http }
    }
}

impl ActionTransport for HttpActionClient {
    fn submit_image(
        &self,
        image: &StagedImage,
        car_identifier: Option<&str>,
    ) -> Result<Ack, ClientError> {
        let part = MultipartPart::bytes(image.bytes.clone())
            .file_name(image.file_name())
            .mime_str("image/jpeg")
            .map_err(|err| ClientError::validation(format!("invalid image part: {err}")))?;
        let mut form = MultipartForm::new().part("file", part);
        if let Some(plate) = car_identifier.map(str::trim).filter(|value| !value.is_empty()) {
            form = form.text("car_number", plate.to_string());
        }

        let endpoint = self.config.upload_endpoint();
        let response = self
            .http
            .post(&endpoint)
            .multipart(form)
            .send()
            .map_err(|err| {
                ClientError::transport(format!("image upload failed ({endpoint}): {err}"))
            })?;
        ack_from_response(&endpoint, response)
    }

    fn submit_identifier(&self, identifier: &str) -> Result<Ack, ClientError> {
        let plate = identifier.trim();
        if plate.is_empty() {
            return Err(ClientError::validation("car identifier is empty"));
        }

        let payload = json!({
            "message": identifier_message(plate),
            "timestamp": now_utc_iso(),
            "car_number": plate,
        });
        let endpoint = self.config.message_endpoint();
        let response = self
            .http
            .post(&endpoint)
            .json(&payload)
            .send()
            .map_err(|err| {
                ClientError::transport(format!("identifier submit failed ({endpoint}): {err}"))
            })?;
        ack_from_response(&endpoint, response)
    }
}

fn ack_from_response(endpoint: &str, response: HttpResponse) -> Result<Ack, ClientError> {
    let status = response.status();
    let body = response.text().map_err(|err| {
        ClientError::transport(format!("failed reading response body ({endpoint}): {err}"))
    })?;
    if !status.is_success() {
        return Err(ClientError::transport(format!(
            "request failed ({}): {}",
            status.as_u16(),
            truncate_text(&body, ERROR_BODY_MAX_CHARS)
        )));
    }
    Ack::from_body(&body)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

/// Acknowledges immediately without touching the network. Keeps the full
/// submit/confirm path exercisable offline.
#[derive(Debug, Default)]
pub struct DryRunActionClient;

impl ActionTransport for DryRunActionClient {
    fn submit_image(
        &self,
        image: &StagedImage,
        car_identifier: Option<&str>,
    ) -> Result<Ack, ClientError> {
        let image_path = format!("dryrun/{}.jpg", image.short_fingerprint());
        let mut raw = Map::new();
        raw.insert("status".to_string(), Value::String("ok".to_string()));
        raw.insert("image_path".to_string(), Value::String(image_path.clone()));
        if let Some(plate) = car_identifier.map(str::trim).filter(|value| !value.is_empty()) {
            raw.insert("car_number".to_string(), Value::String(plate.to_string()));
        }
        Ok(Ack {
            image_path: Some(image_path),
            message: None,
            raw,
        })
    }

    fn submit_identifier(&self, identifier: &str) -> Result<Ack, ClientError> {
        let plate = identifier.trim();
        if plate.is_empty() {
            return Err(ClientError::validation("car identifier is empty"));
        }
        let message = identifier_message(plate);
        let mut raw = Map::new();
        raw.insert("status".to_string(), Value::String("ok".to_string()));
        raw.insert("message".to_string(), Value::String(message.clone()));
        Ok(Ack {
            image_path: None,
            message: Some(message),
            raw,
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PermissionState {
    Granted,
    Denied,
}

pub enum CaptureOutcome {
    Captured(StagedImage),
    Cancelled,
}

/// Boundary to the camera/gallery collaborator. `Denied` and `Cancelled`
/// leave staged state untouched.
pub trait CaptureSource {
    fn request_permission(&mut self) -> PermissionState;
    fn capture(&mut self) -> CaptureOutcome;
}

/// Owns the pre-insertion working state: at most one staged image and one
/// staged identifier, orthogonal slots submitted via separate actions.
pub struct CaptureCoordinator {
    pending_image: Option<StagedImage>,
    pending_identifier: String,
    echo_tx: Sender<FeedSignal>,
    journal: Journal,
}

impl CaptureCoordinator {
    pub fn new(echo_tx: Sender<FeedSignal>, journal: Journal) -> Self {
        Self {
            pending_image: None,
            pending_identifier: String::new(),
            echo_tx,
            journal,
        }
    }

    /// Replaces any previously staged image. A submission already in
    /// flight for the old handle is not cancelled and completes or fails
    /// on its own.
    pub fn stage_image(&mut self, image: StagedImage) {
        self.pending_image = Some(image);
    }

    pub fn stage_identifier(&mut self, text: &str) {
        self.pending_identifier = truncate_car_identifier(text);
    }

    pub fn pending_image(&self) -> Option<&StagedImage> {
        self.pending_image.as_ref()
    }

    pub fn has_pending_image(&self) -> bool {
        self.pending_image.is_some()
    }

    pub fn pending_identifier(&self) -> &str {
        &self.pending_identifier
    }

    pub fn discard_image(&mut self) {
        self.pending_image = None;
    }

    pub fn discard_identifier(&mut self) {
        self.pending_identifier.clear();
    }

    /// Runs the capture collaborator and stages the result. Returns
    /// `Ok(false)` when the user cancelled; denial is a permission error.
    pub fn acquire_image(&mut self, source: &mut dyn CaptureSource) -> Result<bool, ClientError> {
        if source.request_permission() == PermissionState::Denied {
            let _ = self.journal.emit("capture_denied", JournalPayload::new());
            return Err(ClientError::permission("camera access denied"));
        }
        match source.capture() {
            CaptureOutcome::Cancelled => {
                let _ = self.journal.emit("capture_cancelled", JournalPayload::new());
                Ok(false)
            }
            CaptureOutcome::Captured(image) => {
                self.stage_image(image);
                Ok(true)
            }
        }
    }

    /// Submits the staged image, with the staged identifier attached when
    /// present. On ack only the image slot is cleared; the identifier
    /// stays staged for its own submission. On any error the staged state
    /// is left unchanged so the user can retry.
    pub fn confirm_image_submit(
        &mut self,
        transport: &dyn ActionTransport,
    ) -> Result<Ack, ClientError> {
        let Some(image) = self.pending_image.as_ref() else {
            return Err(ClientError::validation("no image staged for submission"));
        };
        let plate = (!self.pending_identifier.is_empty()).then(|| self.pending_identifier.clone());

        match transport.submit_image(image, plate.as_deref()) {
            Ok(ack) => {
                let _ = self.journal.emit(
                    "action_submitted",
                    map_object(json!({
                        "action": "image",
                        "fingerprint": image.short_fingerprint(),
                        "car_number": plate,
                    })),
                );
                let image_ref = ack.image_path.clone();
                self.pending_image = None;
                // Optimistic echo. The protocol carries no correlation
                // token, so a later server push for this same action is
                // appended as a second entry, not deduplicated.
                let _ = self.echo_tx.send(FeedSignal::Entry(FeedEntryDraft {
                    origin: EntryOrigin::Own,
                    text: None,
                    image_ref,
                    car_identifier: plate,
                    timestamp: now_utc_iso(),
                }));
                Ok(ack)
            }
            Err(err) => {
                self.journal_failure("image", &err);
                Err(err)
            }
        }
    }

    /// Submits the staged identifier. On ack, clears it and echoes the
    /// derived display string; failures leave it staged so re-submission
    /// needs no re-typing.
    pub fn confirm_identifier_submit(
        &mut self,
        transport: &dyn ActionTransport,
    ) -> Result<Ack, ClientError> {
        let plate = self.pending_identifier.trim().to_string();
        if plate.is_empty() {
            return Err(ClientError::validation("car identifier is empty"));
        }

        match transport.submit_identifier(&plate) {
            Ok(ack) => {
                let _ = self.journal.emit(
                    "action_submitted",
                    map_object(json!({
                        "action": "identifier",
                        "car_number": plate,
                    })),
                );
                self.pending_identifier.clear();
                let _ = self.echo_tx.send(FeedSignal::Entry(FeedEntryDraft {
                    origin: EntryOrigin::Own,
                    text: Some(identifier_message(&plate)),
                    image_ref: None,
                    car_identifier: Some(plate),
                    timestamp: now_utc_iso(),
                }));
                Ok(ack)
            }
            Err(err) => {
                self.journal_failure("identifier", &err);
                Err(err)
            }
        }
    }

    fn journal_failure(&self, action: &str, err: &ClientError) {
        let _ = self.journal.emit(
            "action_failed",
            map_object(json!({
                "action": action,
                "kind": err.kind().as_str(),
                "message": err.message(),
            })),
        );
    }
}

fn map_object(value: Value) -> JournalPayload {
    value.as_object().cloned().unwrap_or_default()
}
