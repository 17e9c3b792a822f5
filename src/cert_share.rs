//! Certificate-sharing trust bootstrap (spec §4.6): a short-lived OTP
//! exchange that lets a new client fetch the server's CA certificate over
//! an otherwise-untrusted connection.
//!
//! Grounded on `examples/original_source/utils/crypto/sharing.py`
//! (`CertificateSharing`/`CertificateReceiver`): 6-digit OTP, PBKDF2-SHA256
//! (100k iterations) key derivation, AES-256-GCM encryption, and an HS256
//! JWT (secret = SHA256(OTP) hex) wrapping the envelope as
//! `"TOKEN:<jwt>\n"` on the wire. JWT framing follows `crate::jwt`; the
//! AES-GCM envelope follows the teacher's `crypto::EncryptedData`, extended
//! with the PBKDF2 salt the original needs and `crypto::EncryptedData`
//! doesn't carry.

use std::sync::Arc;
use std::time::Duration;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::constants::{
    DEFAULT_CERT_SHARE_TIMEOUT, OTP_DERIVED_KEY_LEN, OTP_NONCE_LEN, OTP_PBKDF2_ITERATIONS, OTP_SALT_LEN,
};

/// The encrypted-certificate envelope carried inside the JWT payload.
#[derive(Serialize, Deserialize)]
struct Envelope {
    encrypted_cert: String,
    nonce: String,
    salt: String,
    exp: i64,
    iat: i64,
}

fn generate_otp() -> String {
    let mut rng = rand::rng();
    (0..6).map(|_| char::from(b'0' + (rng.next_u32() % 10) as u8)).collect()
}

fn derive_key(otp: &str, salt: &[u8]) -> [u8; OTP_DERIVED_KEY_LEN] {
    let mut key = [0u8; OTP_DERIVED_KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(otp.as_bytes(), salt, OTP_PBKDF2_ITERATIONS, &mut key);
    key
}

fn jwt_secret(otp: &str) -> String {
    let digest = Sha256::digest(otp.as_bytes());
    hex_encode(&digest)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn encrypt_cert(cert_pem: &[u8], otp: &str) -> Result<(Vec<u8>, [u8; OTP_NONCE_LEN], [u8; OTP_SALT_LEN])> {
    let mut salt = [0u8; OTP_SALT_LEN];
    let mut nonce_bytes = [0u8; OTP_NONCE_LEN];
    rand::rng().fill_bytes(&mut salt);
    rand::rng().fill_bytes(&mut nonce_bytes);

    let key = derive_key(otp, &salt);
    let cipher = Aes256Gcm::new_from_slice(&key).expect("derived key is 32 bytes");
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, cert_pem)
        .map_err(|e| anyhow::anyhow!("certificate encryption failed: {e}"))?;

    Ok((ciphertext, nonce_bytes, salt))
}

fn decrypt_cert(ciphertext: &[u8], nonce: &[u8], salt: &[u8], otp: &str) -> Result<Vec<u8>> {
    let key = derive_key(otp, salt);
    let cipher = Aes256Gcm::new_from_slice(&key).expect("derived key is 32 bytes");
    let nonce = Nonce::from_slice(nonce);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| anyhow::anyhow!("certificate decryption failed: {e}"))
}

/// Server-side temporary listener granting one OTP-guarded certificate
/// download, then shutting itself down.
pub struct CertificateSharingServer {
    cert_pem: Vec<u8>,
    host: String,
    port: u16,
    timeout: Duration,
    otp: Arc<Mutex<Option<(String, tokio::time::Instant)>>>,
    shared: Arc<std::sync::atomic::AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CertificateSharingServer {
    pub fn new(cert_pem: Vec<u8>, host: impl Into<String>, port: u16) -> Self {
        Self {
            cert_pem,
            host: host.into(),
            port,
            timeout: DEFAULT_CERT_SHARE_TIMEOUT,
            otp: Arc::new(Mutex::new(None)),
            shared: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    /// Bind the temporary listener, mint a fresh OTP, and start accepting
    /// exactly the clients that arrive within `timeout`. Returns the OTP to
    /// display/communicate out of band.
    pub async fn start_sharing(self: &Arc<Self>) -> Result<String> {
        if self.task.lock().await.is_some() {
            bail!("certificate sharing already in progress");
        }

        let otp = generate_otp();
        let deadline = tokio::time::Instant::now() + self.timeout;
        *self.otp.lock().await = Some((otp.clone(), deadline));
        self.shared.store(false, std::sync::atomic::Ordering::SeqCst);

        let addr = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&addr).await.with_context(|| format!("failed to bind {addr}"))?;
        log::info!("certificate sharing listening on {addr}, OTP valid for {:?}", self.timeout);

        let this = Arc::clone(self);
        *self.task.lock().await = Some(tokio::spawn(async move {
            let _ = tokio::time::timeout(this.timeout, this.accept_loop(listener)).await;
            this.stop_sharing().await;
        }));

        Ok(otp)
    }

    async fn accept_loop(self: &Arc<Self>, listener: TcpListener) {
        loop {
            let Ok((stream, addr)) = listener.accept().await else { return };
            log::info!("certificate sharing client connected from {addr}");
            if let Err(e) = self.handle_client(stream).await {
                log::warn!("certificate sharing failed for {addr}: {e}");
            }
        }
    }

    async fn handle_client(&self, mut stream: TcpStream) -> Result<()> {
        let current = self.otp.lock().await.clone();
        let Some((otp, deadline)) = current else {
            stream.write_all(b"ERROR:OTP_EXPIRED\n").await?;
            return Ok(());
        };
        if tokio::time::Instant::now() >= deadline {
            stream.write_all(b"ERROR:OTP_EXPIRED\n").await?;
            return Ok(());
        }

        let now = chrono::Utc::now().timestamp();
        let (ciphertext, nonce, salt) = encrypt_cert(&self.cert_pem, &otp)?;
        let envelope = Envelope {
            encrypted_cert: BASE64.encode(ciphertext),
            nonce: BASE64.encode(nonce),
            salt: BASE64.encode(salt),
            exp: now + self.timeout.as_secs() as i64,
            iat: now,
        };

        let token = crate::jwt::encode(&envelope, jwt_secret(&otp).as_bytes())?;
        stream.write_all(format!("TOKEN:{token}\n").as_bytes()).await?;
        self.shared.store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    pub async fn stop_sharing(&self) {
        *self.otp.lock().await = None;
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
    }

    pub fn was_shared(&self) -> bool {
        self.shared.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// Client-side single-shot fetch: dial the sharing server, present the OTP,
/// and decrypt the returned certificate.
pub async fn receive_certificate(host: &str, port: u16, otp: &str) -> Result<Vec<u8>> {
    if otp.len() != 6 || !otp.chars().all(|c| c.is_ascii_digit()) {
        bail!("OTP must be exactly six decimal digits");
    }

    let addr = format!("{host}:{port}");
    let stream = tokio::time::timeout(DEFAULT_CERT_SHARE_TIMEOUT, TcpStream::connect(&addr))
        .await
        .context("certificate sharing connection timed out")?
        .with_context(|| format!("failed to connect to {addr}"))?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    tokio::time::timeout(DEFAULT_CERT_SHARE_TIMEOUT, reader.read_line(&mut line))
        .await
        .context("timed out waiting for certificate response")??;
    let line = line.trim();

    if let Some(reason) = line.strip_prefix("ERROR:") {
        bail!("certificate sharing server reported: {reason}");
    }
    let Some(token) = line.strip_prefix("TOKEN:") else {
        bail!("unexpected certificate sharing response: {line}");
    };

    let envelope: Envelope = crate::jwt::decode(token, jwt_secret(otp).as_bytes()).context("invalid or tampered certificate token")?;

    let now = chrono::Utc::now().timestamp();
    if now >= envelope.exp {
        bail!("certificate token expired");
    }

    let ciphertext = BASE64.decode(&envelope.encrypted_cert).context("invalid ciphertext encoding")?;
    let nonce = BASE64.decode(&envelope.nonce).context("invalid nonce encoding")?;
    let salt = BASE64.decode(&envelope.salt).context("invalid salt encoding")?;

    decrypt_cert(&ciphertext, &nonce, &salt, otp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn otp_is_six_digits() {
        let otp = generate_otp();
        assert_eq!(otp.len(), 6);
        assert!(otp.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let (ciphertext, nonce, salt) = encrypt_cert(b"-----BEGIN CERTIFICATE-----", "123456").unwrap();
        let plaintext = decrypt_cert(&ciphertext, &nonce, &salt, "123456").unwrap();
        assert_eq!(plaintext, b"-----BEGIN CERTIFICATE-----");
    }

    #[test]
    fn wrong_otp_fails_decryption() {
        let (ciphertext, nonce, salt) = encrypt_cert(b"cert-bytes", "123456").unwrap();
        assert!(decrypt_cert(&ciphertext, &nonce, &salt, "654321").is_err());
    }

    #[tokio::test]
    async fn full_sharing_roundtrip_over_loopback() {
        let cert_pem = b"-----BEGIN CERTIFICATE-----\ntest\n-----END CERTIFICATE-----".to_vec();
        let server = Arc::new(CertificateSharingServer::new(cert_pem.clone(), "127.0.0.1", 0));

        // Port 0 means an ephemeral port is chosen; to dial it in-test we
        // bind a listener ourselves first and reuse its address.
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let server = Arc::new(CertificateSharingServer::new(cert_pem.clone(), addr.ip().to_string(), addr.port()));
        let otp = server.start_sharing().await.unwrap();

        let received = receive_certificate(&addr.ip().to_string(), addr.port(), &otp).await.unwrap();
        assert_eq!(received, cert_pem);
        assert!(server.was_shared());
        server.stop_sharing().await;
    }
}
