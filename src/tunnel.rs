//! SSH-forwarded access to the remote source database.
//!
//! The client owns a process-local tunnel: an SSH session, a loopback
//! listener whose connections are piped through direct-tcpip channels, and
//! a MySQL pool dialed through the forwarded port. Connection is lazy and
//! verified end-to-end before the client reports itself connected; a lost
//! connection is retried exactly once per query before the error surfaces.

use russh::client;
use russh_keys::key;
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions, MySqlRow};
use sqlx::MySqlPool;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::copy_bidirectional;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("ssh error: {0}")]
    Ssh(#[from] russh::Error),
    #[error("ssh key error: {0}")]
    Key(#[from] russh_keys::Error),
    #[error("ssh authentication rejected for user {0}")]
    AuthRejected(String),
    #[error("tunnel handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
    #[error("source database error: {0}")]
    Query(#[from] sqlx::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

struct TunnelHandler;

#[async_trait::async_trait]
impl client::Handler for TunnelHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Bastion host keys are managed out of band.
        Ok(true)
    }
}

struct Connected {
    session: Arc<client::Handle<TunnelHandler>>,
    forwarder: JoinHandle<()>,
    local_port: u16,
    pool: MySqlPool,
}

impl Connected {
    fn alive(&self) -> bool {
        !self.session.is_closed() && !self.forwarder.is_finished()
    }
}

pub struct TunnelClient {
    tunnel: config::Tunnel,
    source: config::Source,
    inner: Mutex<Option<Connected>>,
}

impl TunnelClient {
    pub fn new(tunnel: config::Tunnel, source: config::Source) -> Self {
        Self {
            tunnel,
            source,
            inner: Mutex::new(None),
        }
    }

    /// Establish the tunnel and the downstream pool. No-ops when already
    /// connected; a dead session or forwarder is torn down and rebuilt.
    pub async fn connect(&self) -> Result<(), TunnelError> {
        let mut guard = self.inner.lock().await;
        self.connected_pool(&mut guard).await?;
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        let guard = self.inner.lock().await;
        guard.as_ref().is_some_and(Connected::alive)
    }

    /// Run one statement against the source database, connecting lazily.
    /// A connection-lost class of error triggers exactly one
    /// reconnect-and-retry before propagating.
    #[instrument(skip_all)]
    pub async fn execute_query(
        &self,
        sql: &str,
        params: &[&str],
    ) -> Result<Vec<MySqlRow>, TunnelError> {
        let mut guard = self.inner.lock().await;
        let pool = self.connected_pool(&mut guard).await?;
        match run_query(&pool, sql, params).await {
            Ok(rows) => Ok(rows),
            Err(err) if is_connection_lost(&err) => {
                warn!(?err, "source connection lost; reconnecting once");
                teardown(guard.take()).await;
                let pool = self.connected_pool(&mut guard).await?;
                Ok(run_query(&pool, sql, params).await?)
            }
            Err(err) => Err(TunnelError::Query(err)),
        }
    }

    /// Idempotent teardown of the pool, the forwarder and the session.
    pub async fn disconnect(&self) {
        let mut guard = self.inner.lock().await;
        teardown(guard.take()).await;
    }

    async fn connected_pool(
        &self,
        guard: &mut Option<Connected>,
    ) -> Result<MySqlPool, TunnelError> {
        if let Some(conn) = guard.as_ref() {
            if conn.alive() {
                return Ok(conn.pool.clone());
            }
            warn!("tunnel session went away; rebuilding");
            teardown(guard.take()).await;
        }
        let conn = self.establish().await?;
        let pool = conn.pool.clone();
        *guard = Some(conn);
        Ok(pool)
    }

    async fn establish(&self) -> Result<Connected, TunnelError> {
        let timeout = Duration::from_secs(self.tunnel.handshake_timeout_seconds);
        let ssh_config = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(300)),
            ..Default::default()
        });

        let addr = (self.tunnel.host.as_str(), self.tunnel.port);
        let mut session =
            tokio::time::timeout(timeout, client::connect(ssh_config, addr, TunnelHandler))
                .await
                .map_err(|_| TunnelError::HandshakeTimeout(timeout))??;

        let authed = if let Some(password) = self
            .tunnel
            .password
            .as_deref()
            .filter(|p| !p.is_empty())
        {
            session
                .authenticate_password(&self.tunnel.username, password)
                .await?
        } else if let Some(key_file) = self.tunnel.key_file.as_deref() {
            let key = russh_keys::load_secret_key(key_file, None)?;
            session
                .authenticate_publickey(&self.tunnel.username, Arc::new(key))
                .await?
        } else {
            false
        };
        if !authed {
            return Err(TunnelError::AuthRejected(self.tunnel.username.clone()));
        }
        let session = Arc::new(session);

        let listener = TcpListener::bind(("127.0.0.1", self.tunnel.local_port)).await?;
        let local_port = listener.local_addr()?.port();
        let forwarder = tokio::spawn(forward_loop(
            listener,
            Arc::clone(&session),
            self.source.host.clone(),
            self.source.port,
        ));

        // The tunnel only counts as ready once a real statement has gone
        // through the forwarded port.
        let opts = MySqlConnectOptions::new()
            .host("127.0.0.1")
            .port(local_port)
            .username(&self.source.username)
            .password(&self.source.password);
        let pool = MySqlPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(opts)
            .await?;
        sqlx::query("SELECT 1").execute(&pool).await?;

        info!(
            host = %self.tunnel.host,
            local_port,
            "tunnel established and source connection verified"
        );
        Ok(Connected {
            session,
            forwarder,
            local_port,
            pool,
        })
    }
}

async fn forward_loop(
    listener: TcpListener,
    session: Arc<client::Handle<TunnelHandler>>,
    dest_host: String,
    dest_port: u16,
) {
    loop {
        let (mut socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(?err, "tunnel listener accept failed");
                return;
            }
        };
        let session = Arc::clone(&session);
        let dest_host = dest_host.clone();
        tokio::spawn(async move {
            match session
                .channel_open_direct_tcpip(
                    dest_host.as_str(),
                    dest_port as u32,
                    "127.0.0.1",
                    peer.port() as u32,
                )
                .await
            {
                Ok(channel) => {
                    let mut stream = channel.into_stream();
                    if let Err(err) = copy_bidirectional(&mut socket, &mut stream).await {
                        debug!(?err, "forwarded connection closed");
                    }
                }
                Err(err) => warn!(?err, "failed to open direct-tcpip channel"),
            }
        });
    }
}

async fn run_query(
    pool: &MySqlPool,
    sql: &str,
    params: &[&str],
) -> Result<Vec<MySqlRow>, sqlx::Error> {
    let mut query = sqlx::query(sql);
    for param in params {
        query = query.bind(*param);
    }
    query.fetch_all(pool).await
}

async fn teardown(conn: Option<Connected>) {
    let Some(conn) = conn else { return };
    conn.pool.close().await;
    conn.forwarder.abort();
    let _ = conn
        .session
        .disconnect(russh::Disconnect::ByApplication, "", "en")
        .await;
    debug!(local_port = conn.local_port, "tunnel torn down");
}

/// Errors worth a single automatic reconnect: transport failures and the
/// MySQL gone-away/lost-connection codes. Query-shaped errors are not.
fn is_connection_lost(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db) => matches!(db.code().as_deref(), Some("2006") | Some("2013")),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_connection_lost_errors() {
        assert!(is_connection_lost(&sqlx::Error::PoolTimedOut));
        assert!(is_connection_lost(&sqlx::Error::PoolClosed));
        assert!(is_connection_lost(&sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ))));
        assert!(!is_connection_lost(&sqlx::Error::RowNotFound));
    }
}
