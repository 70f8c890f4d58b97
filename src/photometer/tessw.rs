//! Network driver for TESS-family photometers. Modern firmware speaks JSON
//! lines; units flashed before the protocol change emit fixed-tag payloads
//! like `<fH 04606><tA +2987><tO +2481>`. Samples are timestamped on
//! receipt.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{now_us, Photometer, PhotometerInfo, COMMAND_TIMEOUT};
use crate::{Error, Model, Result, Role, Sample};

#[derive(Debug, Clone)]
enum Endpoint {
    Tcp(String),
    Udp(String),
}

pub struct TessDriver {
    model: Model,
    role: Role,
    endpoint: Endpoint,
    old_proto: bool,
}

impl TessDriver {
    pub fn tcp(model: Model, role: Role, addr: String, old_proto: bool) -> Self {
        TessDriver {
            model,
            role,
            endpoint: Endpoint::Tcp(addr),
            old_proto,
        }
    }

    pub fn udp(model: Model, role: Role, addr: String, old_proto: bool) -> Self {
        TessDriver {
            model,
            role,
            endpoint: Endpoint::Udp(addr),
            old_proto,
        }
    }

    fn tcp_addr(&self) -> Result<&str> {
        match &self.endpoint {
            Endpoint::Tcp(addr) => Ok(addr),
            Endpoint::Udp(_) => Err(Error::transport(
                self.role,
                "commands need a tcp:// endpoint",
            )),
        }
    }

    /// One request/response exchange over a fresh TCP connection.
    async fn command(&self, request: serde_json::Value) -> Result<String> {
        let addr = self.tcp_addr()?;
        let exchange = async {
            let mut stream = TcpStream::connect(addr)
                .await
                .map_err(|e| Error::transport(self.role, e.to_string()))?;
            let mut line = request.to_string();
            line.push('\n');
            stream
                .write_all(line.as_bytes())
                .await
                .map_err(|e| Error::transport(self.role, e.to_string()))?;
            let mut reply = String::new();
            let mut reader = BufReader::new(stream);
            reader
                .read_line(&mut reply)
                .await
                .map_err(|e| Error::transport(self.role, e.to_string()))?;
            Ok::<_, Error>(reply)
        };
        match timeout(COMMAND_TIMEOUT, exchange).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(self.role, "command reply")),
        }
    }

    fn decode(&self, line: &str) -> Option<Sample> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let decoded = if self.old_proto {
            parse_legacy(line)
        } else {
            parse_json(line)
        };
        match decoded {
            Some(mut sample) => {
                sample.tstamp = now_us();
                Some(sample)
            }
            None => {
                debug!(role = %self.role, payload = line, "undecodable reading");
                None
            }
        }
    }
}

#[async_trait]
impl Photometer for TessDriver {
    fn role(&self) -> Role {
        self.role
    }

    async fn get_info(&self) -> Result<PhotometerInfo> {
        let reply = self.command(json!({"cmd": "info"})).await?;
        let payload: InfoPayload = serde_json::from_str(reply.trim())
            .map_err(|e| Error::transport(self.role, format!("bad info reply: {e}")))?;
        Ok(PhotometerInfo {
            name: payload.name,
            mac: payload.mac,
            model: self.model,
            sensor: payload.sensor,
            firmware: payload.firmware,
            zp: payload.zp,
            freq_offset: payload.freq_offset,
            filter: payload.filter,
            plug: payload.plug,
            box_: payload.box_,
            collector: payload.collector,
            endpoint: None,
        })
    }

    async fn save_zero_point(&self, zero_point: f64) -> Result<()> {
        let reply = self
            .command(json!({"cmd": "zp", "zp": zero_point}))
            .await?;
        let ack: AckPayload = serde_json::from_str(reply.trim())
            .map_err(|e| Error::transport(self.role, format!("bad zp reply: {e}")))?;
        if ack.ok {
            Ok(())
        } else {
            Err(Error::transport(self.role, "device rejected zero point"))
        }
    }

    async fn readings(&self, tx: mpsc::UnboundedSender<Sample>) {
        match &self.endpoint {
            Endpoint::Tcp(addr) => {
                let stream = match TcpStream::connect(addr).await {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(role = %self.role, %addr, error = %e, "readings connect failed");
                        return;
                    }
                };
                let mut lines = BufReader::new(stream).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            if let Some(sample) = self.decode(&line) {
                                if tx.send(sample).is_err() {
                                    return;
                                }
                            }
                        }
                        Ok(None) => {
                            warn!(role = %self.role, "readings stream closed by peer");
                            return;
                        }
                        Err(e) => {
                            warn!(role = %self.role, error = %e, "readings read failed");
                            return;
                        }
                    }
                }
            }
            Endpoint::Udp(addr) => {
                let socket = match UdpSocket::bind(addr).await {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(role = %self.role, %addr, error = %e, "readings bind failed");
                        return;
                    }
                };
                let mut buf = vec![0u8; 1024];
                loop {
                    match socket.recv_from(&mut buf).await {
                        Ok((n, _)) => {
                            let line = String::from_utf8_lossy(&buf[..n]).into_owned();
                            if let Some(sample) = self.decode(&line) {
                                if tx.send(sample).is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            warn!(role = %self.role, error = %e, "readings recv failed");
                            return;
                        }
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Wire payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct InfoPayload {
    name: String,
    mac: String,
    sensor: Option<String>,
    firmware: Option<String>,
    zp: Option<f64>,
    freq_offset: Option<f64>,
    filter: Option<String>,
    plug: Option<String>,
    #[serde(rename = "box")]
    box_: Option<String>,
    collector: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AckPayload {
    ok: bool,
}

#[derive(Debug, Deserialize)]
struct ReadingPayload {
    seq: Option<i64>,
    freq: f64,
    tamb: Option<f64>,
    tsky: Option<f64>,
}

fn parse_json(line: &str) -> Option<Sample> {
    let payload: ReadingPayload = serde_json::from_str(line).ok()?;
    Some(Sample {
        tstamp: now_us(),
        seq: payload.seq,
        freq: payload.freq,
        tamb: payload.tamb,
        tsky: payload.tsky,
    })
}

/// Legacy payload: angle-bracketed tag/value pairs, e.g.
/// `<fH 04606><tA +2987><tO +2481>`. `fH` is Hz x 10, temperatures are
/// °C x 100.
fn parse_legacy(line: &str) -> Option<Sample> {
    let mut freq = None;
    let mut tamb = None;
    let mut tsky = None;
    for field in line.split('<').filter(|f| !f.is_empty()) {
        let field = field.trim_end().strip_suffix('>')?;
        let (tag, value) = field.split_at(2.min(field.len()));
        let value: f64 = value.trim().parse().ok()?;
        match tag {
            "fH" => freq = Some(value / 10.0),
            "tA" => tamb = Some(value / 100.0),
            "tO" => tsky = Some(value / 100.0),
            _ => {} // mZ and friends are not sampled
        }
    }
    Some(Sample {
        tstamp: now_us(),
        seq: None,
        freq: freq?,
        tamb,
        tsky,
    })
}
