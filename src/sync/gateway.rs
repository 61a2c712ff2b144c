//! Admission and session lifecycle of sync connections.
//!
//! A connection is admitted with a capability token or, without one, only
//! from loopback. Once admitted it is attached to the shared document for
//! its `(project, file)` key and pumps binary frames in both directions
//! until either side closes.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::document::{DocumentHandle, DocumentLocation};
use super::registry::DocumentRegistry;
use super::{document_key, DocumentKey, SessionId, SyncError};
use crate::auth::{self, TokenCodec};
use crate::project::{self, PathError, ProjectResolver, PROJECT_METADATA_FILE};

/// WebSocket close codes sent to refused or failed sessions
pub mod close_code {
    pub const UNAUTHORIZED: u16 = 4401;
    pub const MISSING_PARAMETER: u16 = 4400;
    pub const PROJECT_MISMATCH: u16 = 4409;
    pub const PROJECT_NOT_FOUND: u16 = 4404;
    pub const INVALID_PATH: u16 = 4403;
    pub const UNSUPPORTED: u16 = 1003;
    pub const PROTOCOL: u16 = 1002;
    pub const INTERNAL: u16 = 1011;
}

/// Query parameters of a sync connection
#[derive(Debug, Clone, Default)]
pub struct ConnectParams {
    pub token: Option<String>,
    pub project_id: Option<String>,
    pub file: Option<String>,
}

impl ConnectParams {
    /// Collect `token`, `projectId` and `file` from raw query pairs. A
    /// repeated key keeps its first value; unknown keys are ignored.
    pub fn from_query_pairs(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut params = Self::default();
        for (name, value) in pairs {
            let slot = match name.as_str() {
                "token" => &mut params.token,
                "projectId" => &mut params.project_id,
                "file" => &mut params.file,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(value);
            }
        }
        params
    }
}

/// Reasons a connection is refused
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Missing project or file")]
    MissingParameter,

    #[error("Project mismatch")]
    ProjectMismatch,

    #[error("Project not found")]
    ProjectNotFound,

    #[error("Binary file")]
    BinaryFile,

    #[error("Invalid path")]
    InvalidPath,
}

impl AdmissionError {
    pub fn close_code(&self) -> u16 {
        match self {
            AdmissionError::Unauthorized => close_code::UNAUTHORIZED,
            AdmissionError::MissingParameter => close_code::MISSING_PARAMETER,
            AdmissionError::ProjectMismatch => close_code::PROJECT_MISMATCH,
            AdmissionError::ProjectNotFound => close_code::PROJECT_NOT_FOUND,
            AdmissionError::BinaryFile => close_code::UNSUPPORTED,
            AdmissionError::InvalidPath => close_code::INVALID_PATH,
        }
    }
}

/// An admitted connection's target document
#[derive(Debug, Clone)]
pub struct Admission {
    pub project_id: String,
    pub key: DocumentKey,
    pub location: DocumentLocation,
}

/// Registry key and backing file of `file` within a project root.
///
/// The key uses the normalized relative path so that spellings such as
/// `a/./b.tex` and `a/b.tex` share one document.
pub fn locate_document(
    project_id: &str,
    root: &Path,
    file: &str,
) -> Result<(DocumentKey, DocumentLocation), PathError> {
    let absolute_path = project::safe_join(root, file)?;
    let relative = absolute_path
        .strip_prefix(root)
        .map(|path| path.to_string_lossy().into_owned())
        .unwrap_or_else(|_| file.to_string());

    let location = DocumentLocation {
        absolute_path,
        metadata_path: Some(root.join(PROJECT_METADATA_FILE)),
    };
    Ok((document_key(project_id, &relative), location))
}

/// Accepts sync connections and attaches them to shared documents
pub struct SyncGateway {
    tokens: Arc<TokenCodec>,
    projects: Arc<dyn ProjectResolver>,
    registry: Arc<DocumentRegistry>,
}

impl SyncGateway {
    pub fn new(
        tokens: Arc<TokenCodec>,
        projects: Arc<dyn ProjectResolver>,
        registry: Arc<DocumentRegistry>,
    ) -> Self {
        Self {
            tokens,
            projects,
            registry,
        }
    }

    /// Decide whether a connection from `peer_ip` may open the requested file
    pub async fn admit(&self, params: &ConnectParams, peer_ip: IpAddr) -> Result<Admission, AdmissionError> {
        let token = non_empty(&params.token);
        let query_project = non_empty(&params.project_id);
        let file = non_empty(&params.file);

        let claims = match token {
            Some(token) => match self.tokens.verify(token) {
                Ok(claims) => Some(claims),
                Err(e) => {
                    warn!("Rejected sync connection from {}: {}", peer_ip, e);
                    return Err(AdmissionError::Unauthorized);
                }
            },
            None if auth::is_local_address(peer_ip) => None,
            None => {
                warn!("Rejected tokenless sync connection from {}", peer_ip);
                return Err(AdmissionError::Unauthorized);
            }
        };

        let project_id = claims
            .as_ref()
            .map(|claims| claims.project_id.as_str())
            .or(query_project)
            .ok_or(AdmissionError::MissingParameter)?;
        let file = file.ok_or(AdmissionError::MissingParameter)?;

        if let (Some(claims), Some(requested)) = (&claims, query_project) {
            if claims.project_id != requested {
                return Err(AdmissionError::ProjectMismatch);
            }
        }

        let root = self.projects.resolve_root(project_id).await.map_err(|e| {
            debug!("Project {} not resolved: {}", project_id, e);
            AdmissionError::ProjectNotFound
        })?;

        if !project::is_text_file(file) {
            return Err(AdmissionError::BinaryFile);
        }

        let (key, location) = locate_document(project_id, &root, file).map_err(|e| {
            warn!("Rejected path {:?} from {} for project {}: {}", file, peer_ip, project_id, e);
            AdmissionError::InvalidPath
        })?;

        Ok(Admission {
            project_id: project_id.to_string(),
            key,
            location,
        })
    }

    /// Run one connection to completion
    pub async fn handle_socket(&self, mut socket: WebSocket, params: ConnectParams, peer_ip: IpAddr) {
        let admission = match self.admit(&params, peer_ip).await {
            Ok(admission) => admission,
            Err(e) => {
                close_socket(&mut socket, e.close_code(), &e.to_string()).await;
                return;
            }
        };

        let session_id = Uuid::new_v4();
        let (outbound_tx, outbound_rx) = mpsc::channel::<Bytes>(self.registry.config().outbound_buffer.max(1));

        let handle = match self
            .registry
            .attach(&admission.key, admission.location, session_id, outbound_tx)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                error!("Failed to attach to {}: {}", admission.key, e);
                close_socket(&mut socket, close_code::INTERNAL, "Document unavailable").await;
                return;
            }
        };

        info!("Session {} from {} opened {}", session_id, peer_ip, admission.key);
        run_session(socket, handle.clone(), session_id, outbound_rx).await;
        handle.detach(session_id).await;
        info!("Session {} closed", session_id);
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|value| !value.is_empty())
}

async fn close_socket(socket: &mut WebSocket, code: u16, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: Cow::Owned(reason.to_string()),
    };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        debug!("Failed to send close frame: {}", e);
    }
}

/// Pump frames between the socket and the document until either side stops
async fn run_session(
    socket: WebSocket,
    handle: DocumentHandle,
    session_id: SessionId,
    mut outbound_rx: mpsc::Receiver<Bytes>,
) {
    let (mut sender, mut receiver) = socket.split();
    let (close_tx, mut close_rx) = oneshot::channel::<CloseFrame<'static>>();

    // Writer: document frames out, then an optional close frame
    let mut send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = outbound_rx.recv() => {
                    let Some(frame) = frame else { break };
                    if sender.send(Message::Binary(frame.to_vec())).await.is_err() {
                        break;
                    }
                }
                close = &mut close_rx => {
                    if let Ok(frame) = close {
                        let _ = sender.send(Message::Close(Some(frame))).await;
                    }
                    break;
                }
            }
        }
    });

    // Reader: client frames into the document, in order
    let mut recv_task = tokio::spawn(async move {
        while let Some(message) = receiver.next().await {
            match message {
                Ok(Message::Binary(data)) => {
                    let Err(e) = handle.deliver(session_id, Bytes::from(data)).await else {
                        continue;
                    };
                    let code = match e {
                        SyncError::Protocol(_) | SyncError::Replica(_) => {
                            warn!("Closing session {}: {}", session_id, e);
                            close_code::PROTOCOL
                        }
                        _ => {
                            error!("Closing session {}: {}", session_id, e);
                            close_code::INTERNAL
                        }
                    };
                    let _ = close_tx.send(CloseFrame {
                        code,
                        reason: Cow::Owned(e.to_string()),
                    });
                    return;
                }
                Ok(Message::Text(_)) => {
                    debug!("Ignoring text frame from session {}", session_id);
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!("WebSocket error on session {}: {}", session_id, e);
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => {
            // Lets the writer flush a pending close frame
            let _ = send_task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::ProjectDirectory;
    use crate::sync::protocol::{self, ContentMessage, Frame};
    use crate::sync::presence::{decode_client_ids, encode_entries};
    use crate::sync::replica::{Replica, TextReplica};
    use crate::sync::SyncConfig;
    use axum::extract::{ConnectInfo, Query, State, WebSocketUpgrade};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    const REMOTE: &str = "203.0.113.9";
    const LOCAL: &str = "127.0.0.1";

    fn setup() -> (TempDir, SyncGateway, Arc<TokenCodec>) {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("proj-a")).unwrap();
        std::fs::create_dir_all(dir.path().join("proj-b")).unwrap();
        let tokens = Arc::new(TokenCodec::new("gateway-secret", 3600).unwrap());
        let gateway = SyncGateway::new(
            tokens.clone(),
            Arc::new(ProjectDirectory::new(dir.path())),
            Arc::new(DocumentRegistry::new(SyncConfig::default())),
        );
        (dir, gateway, tokens)
    }

    fn params(token: Option<&str>, project: Option<&str>, file: Option<&str>) -> ConnectParams {
        ConnectParams {
            token: token.map(str::to_string),
            project_id: project.map(str::to_string),
            file: file.map(str::to_string),
        }
    }

    fn ip(addr: &str) -> IpAddr {
        addr.parse().unwrap()
    }

    #[tokio::test]
    async fn test_tokenless_remote_refused() {
        let (_dir, gateway, _) = setup();
        let err = gateway
            .admit(&params(None, Some("proj-a"), Some("main.tex")), ip(REMOTE))
            .await
            .unwrap_err();
        assert_eq!(err, AdmissionError::Unauthorized);
        assert_eq!(err.close_code(), 4401);
    }

    #[tokio::test]
    async fn test_tokenless_loopback_admitted() {
        let (dir, gateway, _) = setup();
        let admission = gateway
            .admit(&params(None, Some("proj-a"), Some("main.tex")), ip(LOCAL))
            .await
            .unwrap();
        assert_eq!(admission.key, "proj-a:main.tex");
        assert_eq!(admission.location.absolute_path, dir.path().join("proj-a/main.tex"));
        assert_eq!(
            admission.location.metadata_path,
            Some(dir.path().join("proj-a/project.json"))
        );

        let mapped = gateway
            .admit(&params(None, Some("proj-a"), Some("main.tex")), ip("::ffff:127.0.0.1"))
            .await;
        assert!(mapped.is_ok());
    }

    #[tokio::test]
    async fn test_token_admission() {
        let (_dir, gateway, tokens) = setup();
        let token = tokens.issue_invite("proj-a").unwrap();

        // The token alone names the project
        let admission = gateway
            .admit(&params(Some(&token), None, Some("main.tex")), ip(REMOTE))
            .await
            .unwrap();
        assert_eq!(admission.project_id, "proj-a");

        let err = gateway
            .admit(&params(Some(&token), Some("proj-b"), Some("main.tex")), ip(REMOTE))
            .await
            .unwrap_err();
        assert_eq!(err, AdmissionError::ProjectMismatch);
        assert_eq!(err.close_code(), 4409);

        let err = gateway
            .admit(&params(Some("op1.bogus.sig"), None, Some("main.tex")), ip(LOCAL))
            .await
            .unwrap_err();
        assert_eq!(err, AdmissionError::Unauthorized);
    }

    async fn refused(gateway: &SyncGateway, project: Option<&str>, file: Option<&str>) -> AdmissionError {
        gateway
            .admit(&params(None, project, file), ip(LOCAL))
            .await
            .unwrap_err()
    }

    #[tokio::test]
    async fn test_admission_failures() {
        let (_dir, gateway, _) = setup();

        assert_eq!(refused(&gateway, Some("proj-a"), None).await, AdmissionError::MissingParameter);
        assert_eq!(refused(&gateway, None, Some("main.tex")).await, AdmissionError::MissingParameter);
        assert_eq!(
            refused(&gateway, Some("proj-z"), Some("main.tex")).await,
            AdmissionError::ProjectNotFound
        );
        assert_eq!(
            refused(&gateway, Some("proj-a"), Some("figure.png")).await,
            AdmissionError::BinaryFile
        );
        assert_eq!(AdmissionError::BinaryFile.close_code(), 1003);
        assert_eq!(
            refused(&gateway, Some("proj-a"), Some("../proj-b/main.tex")).await,
            AdmissionError::InvalidPath
        );
        assert_eq!(
            refused(&gateway, Some("proj-a"), Some("/etc/hosts.txt")).await,
            AdmissionError::InvalidPath
        );
        assert_eq!(AdmissionError::InvalidPath.close_code(), 4403);
    }

    #[test]
    fn test_locate_document_normalizes_key() {
        let root = Path::new("/projects/p1");
        let (key, location) = locate_document("p1", root, "chapters/./intro.tex").unwrap();
        assert_eq!(key, "p1:chapters/intro.tex");
        assert_eq!(location.absolute_path, root.join("chapters/intro.tex"));
    }

    #[test]
    fn test_connect_params_first_value_wins() {
        let pairs = [
            ("file", "main.tex"),
            ("projectId", "proj-a"),
            ("file", "other.tex"),
            ("projectId", "proj-b"),
            ("theme", "dark"),
        ]
        .map(|(k, v)| (k.to_string(), v.to_string()));

        let params = ConnectParams::from_query_pairs(pairs);
        assert_eq!(params.project_id.as_deref(), Some("proj-a"));
        assert_eq!(params.file.as_deref(), Some("main.tex"));
        assert_eq!(params.token, None);
    }

    // ===== END TO END =====

    async fn ws_route(
        ws: WebSocketUpgrade,
        State(gateway): State<Arc<SyncGateway>>,
        ConnectInfo(addr): ConnectInfo<SocketAddr>,
        Query(pairs): Query<Vec<(String, String)>>,
    ) -> impl IntoResponse {
        let params = ConnectParams::from_query_pairs(pairs);
        ws.on_upgrade(move |socket| async move { gateway.handle_socket(socket, params, addr.ip()).await })
    }

    async fn serve(gateway: SyncGateway) -> SocketAddr {
        let app = Router::new()
            .route("/api/collab", get(ws_route))
            .with_state(Arc::new(gateway));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                .await
                .unwrap();
        });
        addr
    }

    type Client = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

    async fn connect(addr: SocketAddr, query: &str) -> Client {
        let url = format!("ws://{}/api/collab?{}", addr, query);
        let (client, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        client
    }

    async fn next_binary(client: &mut Client) -> Frame {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(2), client.next())
                .await
                .expect("timed out")
                .expect("stream ended")
                .unwrap();
            if let WsMessage::Binary(data) = message {
                return protocol::decode_frame(&data).unwrap();
            }
        }
    }

    async fn close_code_of(client: &mut Client) -> u16 {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(2), client.next())
                .await
                .expect("timed out")
                .expect("stream ended")
                .unwrap();
            if let WsMessage::Close(Some(frame)) = message {
                return u16::from(frame.code);
            }
        }
    }

    #[tokio::test]
    async fn test_end_to_end_presence_and_handshake() {
        let (dir, gateway, _) = setup();
        std::fs::write(dir.path().join("proj-a/main.tex"), "Hello").unwrap();
        let addr = serve(gateway).await;

        let mut first = connect(addr, "projectId=proj-a&file=main.tex").await;
        let mut second = connect(addr, "projectId=proj-a&file=main.tex").await;
        assert!(matches!(
            next_binary(&mut first).await,
            Frame::Content(ContentMessage::StateVector(_))
        ));
        assert!(matches!(
            next_binary(&mut second).await,
            Frame::Content(ContentMessage::StateVector(_))
        ));

        let update = encode_entries([(11, 1, Some(r#"{"name":"ada"}"#))]);
        first
            .send(WsMessage::Binary(protocol::encode_presence(&update).to_vec()))
            .await
            .unwrap();

        let Frame::Presence(relayed) = next_binary(&mut second).await else {
            panic!("expected presence");
        };
        assert_eq!(decode_client_ids(&relayed), vec![11]);

        // Malformed presence keeps the connection open
        first.send(WsMessage::Binary(vec![1, 5, 0])).await.unwrap();

        // Truncated content closes it with a protocol error
        first.send(WsMessage::Binary(vec![0, 2, 9, 1])).await.unwrap();
        assert_eq!(close_code_of(&mut first).await, close_code::PROTOCOL);

        // Its presence is retracted for the remaining session
        let Frame::Presence(removal) = next_binary(&mut second).await else {
            panic!("expected removal");
        };
        assert_eq!(decode_client_ids(&removal), vec![11]);
    }

    #[tokio::test]
    async fn test_end_to_end_truncated_update_closes_session() {
        let (dir, gateway, _) = setup();
        std::fs::write(dir.path().join("proj-a/main.tex"), "Hello").unwrap();
        let addr = serve(gateway).await;

        // Repeated keys keep the first value
        let mut client = connect(addr, "projectId=proj-a&file=main.tex&file=missing.png").await;
        assert!(matches!(
            next_binary(&mut client).await,
            Frame::Content(ContentMessage::StateVector(_))
        ));

        let mut replica = TextReplica::new("client");
        let request = ContentMessage::StateVector(Bytes::from(replica.state_vector()));
        client
            .send(WsMessage::Binary(protocol::encode_content(&request).to_vec()))
            .await
            .unwrap();
        let Frame::Content(ContentMessage::MissingOperations(ops)) = next_binary(&mut client).await else {
            panic!("expected missing operations");
        };
        replica.apply_remote_operation(&ops).unwrap();

        let mut update = replica.splice(5, 0, " world").unwrap();
        update.truncate(update.len() - 5);
        let frame = protocol::encode_content(&ContentMessage::Update(Bytes::from(update)));
        client.send(WsMessage::Binary(frame.to_vec())).await.unwrap();

        assert_eq!(close_code_of(&mut client).await, close_code::PROTOCOL);
        assert_eq!(std::fs::read_to_string(dir.path().join("proj-a/main.tex")).unwrap(), "Hello");
    }

    #[tokio::test]
    async fn test_end_to_end_refusal_close_code() {
        let (_dir, gateway, _) = setup();
        let addr = serve(gateway).await;

        let mut client = connect(addr, "projectId=proj-a&file=figure.png").await;
        assert_eq!(close_code_of(&mut client).await, close_code::UNSUPPORTED);

        let mut client = connect(addr, "projectId=proj-a").await;
        assert_eq!(close_code_of(&mut client).await, close_code::MISSING_PARAMETER);
    }
}
