//! HTTP control-plane and CSI WebSocket stream client for a single
//! ESPARGOS controller board (§4.2).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use espargos_wire::{decode_stream_packet, SerializedCsi, STREAM_PACKET_BYTES};
use futures_util::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

const HTTP_TIMEOUT: Duration = Duration::from_secs(5);
const CSISTREAM_RECV_TIMEOUT: Duration = Duration::from_millis(200);
const CSISTREAM_SILENCE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
pub struct NetConf {
    pub hostname: String,
}

#[derive(Debug, Deserialize)]
pub struct IpInfo {
    pub ip: String,
}

#[derive(Debug, Deserialize)]
pub struct WifiConf {
    pub channel_primary: u8,
    pub channel_secondary: u8,
}

/// One `(board_index, esp_num, record)` delivered on a pool's shared
/// consumer queue; `board_index` is assigned by the pool at registration
/// time, since a board has no notion of its own position within it.
pub type ConsumerItem = (usize, u32, SerializedCsi);
pub type ConsumerQueue = Arc<(Mutex<VecDeque<ConsumerItem>>, Condvar)>;

/// A single ESPARGOS board reachable at `host`, after the identification
/// handshake has completed.
pub struct Board {
    host: String,
    netconf: NetConf,
    ip_info: IpInfo,
    wificonf: WifiConf,
    http: Client,
    connected: AtomicBool,
    consumers: Mutex<Vec<(usize, ConsumerQueue)>>,
}

impl Board {
    /// Connect to `host` and run the identification handshake
    /// (`identify`, `get_netconf`, `get_ip_info`, `get_wificonf`).
    pub async fn connect(host: impl Into<String>) -> Result<Arc<Self>> {
        let host = host.into();
        url::Url::parse(&format!("http://{host}"))?;
        let http = Client::builder().timeout(HTTP_TIMEOUT).build()?;

        let identification = fetch(&http, &host, "identify", None).await?;
        if identification.trim() != "ESPARGOS" {
            return Err(Error::UnexpectedResponse { host: host.clone(), detail: identification });
        }

        let netconf: NetConf = serde_json::from_str(&fetch(&http, &host, "get_netconf", None).await?)
            .map_err(|e| Error::UnexpectedResponse { host: host.clone(), detail: e.to_string() })?;
        let ip_info: IpInfo = serde_json::from_str(&fetch(&http, &host, "get_ip_info", None).await?)
            .map_err(|e| Error::UnexpectedResponse { host: host.clone(), detail: e.to_string() })?;
        let wificonf: WifiConf = serde_json::from_str(&fetch(&http, &host, "get_wificonf", None).await?)
            .map_err(|e| Error::UnexpectedResponse { host: host.clone(), detail: e.to_string() })?;

        info!(host = %host, ip = %ip_info.ip, name = %netconf.hostname, "identified ESPARGOS board");

        Ok(Arc::new(Self {
            host,
            netconf,
            ip_info,
            wificonf,
            http,
            connected: AtomicBool::new(false),
            consumers: Mutex::new(Vec::new()),
        }))
    }

    pub fn name(&self) -> &str {
        &self.netconf.hostname
    }

    pub fn ip(&self) -> &str {
        &self.ip_info.ip
    }

    pub fn channel_primary(&self) -> u8 {
        self.wificonf.channel_primary
    }

    pub fn channel_secondary(&self) -> u8 {
        self.wificonf.channel_secondary
    }

    /// Enable or disable calibration-signal injection on this board.
    pub async fn set_calib(&self, calibrate: bool) -> Result<()> {
        let body = if calibrate { "1" } else { "0" };
        let res = fetch(&self.http, &self.host, "set_calib", Some(body)).await?;
        if res.trim() != "ok" {
            error!(host = %self.host, response = %res, "unexpected set_calib response");
            return Err(Error::UnexpectedResponse { host: self.host.clone(), detail: res });
        }
        Ok(())
    }

    /// Register a queue to receive every `(board_index, esp_num, record)`
    /// decoded from this board's CSI stream from now on. `board_index` is
    /// stamped onto every item so a pool fusing several boards' streams
    /// through one shared queue can tell them apart.
    pub fn add_consumer(&self, board_index: usize, queue: ConsumerQueue) {
        self.consumers.lock().unwrap().push((board_index, queue));
    }

    /// Start the CSI WebSocket stream on a small dedicated runtime, one OS
    /// thread per board, so a slow or wedged board can never starve another
    /// board's stream or the embedder's own async work.
    pub fn start(self: &Arc<Self>) {
        self.connected.store(true, Ordering::SeqCst);
        let board = Arc::clone(self);
        std::thread::Builder::new()
            .name(format!("csistream-{}", self.host))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!(host = %board.host, error = %e, "failed to start board runtime");
                        return;
                    }
                };
                runtime.block_on(async {
                    if let Err(e) = board.csistream_loop().await {
                        warn!(host = %board.host, error = %e, "CSI stream ended");
                    }
                });
            })
            .expect("failed to spawn board CSI stream thread");
        info!(host = %self.host, "started CSI stream");
    }

    pub fn stop(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn csistream_loop(&self) -> Result<()> {
        let url = format!("ws://{}/csi", self.host);
        let (ws, _) = tokio_tungstenite::connect_async(&url).await?;
        let (_write, mut read) = ws.split();

        let mut silence = Duration::ZERO;
        while self.is_connected() {
            match timeout(CSISTREAM_RECV_TIMEOUT, read.next()).await {
                Ok(Some(Ok(Message::Binary(data)))) => {
                    silence = Duration::ZERO;
                    self.csistream_handle_message(&data);
                }
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(e))) => return Err(Error::WebSocket(e)),
                Ok(None) => break,
                Err(_) => {
                    silence += CSISTREAM_RECV_TIMEOUT;
                    if silence > CSISTREAM_SILENCE_TIMEOUT {
                        warn!(host = %self.host, "CSI stream timed out, disconnecting");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn csistream_handle_message(&self, message: &[u8]) {
        if message.len() % STREAM_PACKET_BYTES != 0 {
            debug!(host = %self.host, len = message.len(), "CSI stream message not packet-aligned, dropping");
            return;
        }

        let consumers = self.consumers.lock().unwrap();
        for chunk in message.chunks(STREAM_PACKET_BYTES) {
            let packet = match decode_stream_packet(chunk) {
                Ok(p) => p,
                Err(e) => {
                    debug!(host = %self.host, error = %e, "dropping undecodable CSI stream packet");
                    continue;
                }
            };

            for (board_index, queue) in consumers.iter() {
                let (lock, cv) = &**queue;
                let mut q = lock.lock().unwrap();
                q.push_back((*board_index, packet.esp_num, packet.record.clone()));
                cv.notify_all();
            }
        }
    }
}

#[cfg(test)]
impl Board {
    pub(crate) fn test_instance() -> Self {
        Self {
            host: "test-board".into(),
            netconf: NetConf { hostname: "test-board".into() },
            ip_info: IpInfo { ip: "127.0.0.1".into() },
            wificonf: WifiConf { channel_primary: 6, channel_secondary: 10 },
            http: Client::new(),
            connected: AtomicBool::new(false),
            consumers: Mutex::new(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_stream_frame(esp_num: u32) -> Vec<u8> {
        let mut frame = vec![0u8; STREAM_PACKET_BYTES];
        frame[0..4].copy_from_slice(&esp_num.to_le_bytes());
        frame[4..8].copy_from_slice(&espargos_wire::TYPE_HEADER_CSI.to_le_bytes());
        // rx_ctrl (36 zero bytes), source/dest mac, seq_ctrl, timestamp, flags, buf
        // are all left zeroed: SerializedCsi::decode only rejects on magic/length.
        frame
    }

    #[test]
    fn message_not_packet_aligned_is_dropped_silently() {
        let board = Board::test_instance();
        let queue: ConsumerQueue = Arc::new((Mutex::new(VecDeque::new()), Condvar::new()));
        board.add_consumer(0, Arc::clone(&queue));

        board.csistream_handle_message(&vec![0u8; STREAM_PACKET_BYTES - 1]);

        assert!(queue.0.lock().unwrap().is_empty());
    }

    #[test]
    fn handled_packets_fan_out_to_every_consumer_with_board_index() {
        let board = Board::test_instance();
        let queue_a: ConsumerQueue = Arc::new((Mutex::new(VecDeque::new()), Condvar::new()));
        let queue_b: ConsumerQueue = Arc::new((Mutex::new(VecDeque::new()), Condvar::new()));
        board.add_consumer(3, Arc::clone(&queue_a));
        board.add_consumer(3, Arc::clone(&queue_b));

        let mut message = fake_stream_frame(5);
        message.extend(fake_stream_frame(6));
        board.csistream_handle_message(&message);

        for queue in [&queue_a, &queue_b] {
            let items = queue.0.lock().unwrap();
            assert_eq!(items.len(), 2);
            assert_eq!(items[0].0, 3);
            assert_eq!(items[0].1, 5);
            assert_eq!(items[1].1, 6);
        }
    }
}

async fn fetch(http: &Client, host: &str, path: &str, body: Option<&str>) -> Result<String> {
    let url = format!("http://{host}/{path}");
    let request = match body {
        Some(b) => http.post(&url).body(b.to_string()),
        None => http.get(&url),
    };

    let response = timeout(HTTP_TIMEOUT, request.send())
        .await
        .map_err(|_| Error::ConnectTimeout { host: host.to_string() })??;

    if response.status() != reqwest::StatusCode::OK {
        return Err(Error::HttpStatus { host: host.to_string(), path: path.to_string(), status: response.status().as_u16() });
    }

    Ok(response.text().await?)
}
