use std::collections::BTreeMap;
use std::fmt;

use anyhow::{anyhow, bail, Context, Result};
use bytes::{BufMut, BytesMut};
use derivative::Derivative;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use tokio_util::codec::{Decoder, Encoder, LinesCodec};

use crate::util::traits::{ResponseCode, ResponseCodeTrait};

/// Protocol version sent in every request.
pub const PROTOCOL_VERSION: u8 = 0;

/// Longest line accepted from a device. Real devices answer with a few hundred bytes.
pub const MAX_FRAME_LENGTH: usize = 64 * 1024;

/// Register number used by QUERY to ask for every register.
pub const ALL_REGISTERS: u32 = 0;

/// Device state: register number (as a string) to value.
pub type RegisterMap = BTreeMap<String, u64>;

/// Command codes of the CozyLife line protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Device identity (`did`, `pid`, firmware versions ...).
    Info,
    /// Read registers.
    Query,
    /// Write registers.
    Set,
    /// Unsolicited full state report a device pushes after a SET.
    StatusReport,
}

impl Command {
    pub fn code(&self) -> u8 {
        match self {
            Command::Info => 0,
            Command::Query => 2,
            Command::Set => 3,
            Command::StatusReport => 10,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Command::Info),
            2 => Some(Command::Query),
            3 => Some(Command::Set),
            10 => Some(Command::StatusReport),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::Info => "INFO",
            Command::Query => "QUERY",
            Command::Set => "SET",
            Command::StatusReport => "STATUS",
        };
        write!(f, "{}", name)
    }
}

/// A request frame, e.g. `{"pv":0,"cmd":2,"sn":"1636463611798","msg":{"attr":[0]}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestFrame {
    pv: u8,
    cmd: u8,
    sn: String,
    msg: Value,
}

impl RequestFrame {
    pub fn info(sn: String) -> Self {
        Self::with_message(Command::Info, sn, json!({}))
    }

    pub fn query(sn: String) -> Self {
        Self::with_message(Command::Query, sn, json!({ "attr": [ALL_REGISTERS] }))
    }

    /// Builds a SET frame. `attr` lists the register numbers of `registers`, `data` carries
    /// the map itself. Fails if a register key is not a number.
    pub fn set(sn: String, registers: &RegisterMap) -> Result<Self> {
        let attr = registers
            .keys()
            .map(|key| {
                key.parse::<u32>()
                    .with_context(|| format!("Register key {:?} is not a number", key))
            })
            .collect::<Result<Vec<u32>>>()?;
        Ok(Self::with_message(
            Command::Set,
            sn,
            json!({ "attr": attr, "data": registers }),
        ))
    }

    /// Builds a frame for any command that a client may send.
    pub fn new(command: Command, sn: String, registers: &RegisterMap) -> Result<Self> {
        match command {
            Command::Info => Ok(Self::info(sn)),
            Command::Query => Ok(Self::query(sn)),
            Command::Set => Self::set(sn, registers),
            Command::StatusReport => bail!("{} is not a request command", command),
        }
    }

    fn with_message(command: Command, sn: String, msg: Value) -> Self {
        RequestFrame {
            pv: PROTOCOL_VERSION,
            cmd: command.code(),
            sn,
            msg,
        }
    }

    pub fn sn(&self) -> &str {
        &self.sn
    }

    pub fn command(&self) -> Option<Command> {
        Command::from_code(self.cmd as i64)
    }

    pub fn message(&self) -> &Value {
        &self.msg
    }
}

impl fmt::Display for RequestFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.command() {
            Some(command) => write!(f, "{} (sn {})", command, self.sn),
            None => write!(f, "cmd {} (sn {})", self.cmd, self.sn),
        }
    }
}

/// A frame received from a device.
///
/// Every field is optional on the wire; accessors check the shape they need.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ResponseFrame {
    #[serde(default)]
    pub cmd: Option<i64>,
    #[serde(default)]
    pub pv: Option<i64>,
    #[serde(default, deserialize_with = "deserialize_sn")]
    pub sn: Option<String>,
    #[serde(default)]
    pub msg: Option<Value>,
    #[serde(default)]
    pub res: Option<i64>,
}

impl ResponseFrame {
    pub fn parse(line: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(line.trim()).context("Malformed JSON frame")?;
        if !value.is_object() {
            bail!("Frame is not a JSON object");
        }
        serde_json::from_value(value).context("Unexpected frame structure")
    }

    pub fn sn(&self) -> Option<&str> {
        self.sn.as_deref()
    }

    pub fn command(&self) -> Option<Command> {
        self.cmd.and_then(Command::from_code)
    }

    /// The register map in `msg.data`, as sent in QUERY/SET responses and status reports.
    pub fn data(&self) -> Result<RegisterMap> {
        let msg = self.message()?;
        let data = msg
            .get("data")
            .filter(|data| data.is_object())
            .ok_or_else(|| anyhow!("Frame has no data object"))?;
        serde_json::from_value(data.clone()).context("Register values must be unsigned integers")
    }

    /// The identity payload of an INFO response.
    pub fn device_info(&self) -> Result<DeviceInfo> {
        let msg = self.message()?;
        serde_json::from_value(msg.clone()).context("Unexpected device info structure")
    }

    fn message(&self) -> Result<&Value> {
        self.msg
            .as_ref()
            .filter(|msg| msg.is_object())
            .ok_or_else(|| anyhow!("Frame has no msg object"))
    }
}

impl ResponseCodeTrait for ResponseFrame {
    fn response_code(&self) -> ResponseCode {
        Self::map_response_code(self.res)
    }
}

/// Some firmwares echo the serial number as a bare number.
fn deserialize_sn<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<Value> = Deserialize::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(sn)) => Ok(Some(sn)),
        Some(Value::Number(sn)) => Ok(Some(sn.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "invalid serial number: {}",
            other
        ))),
    }
}

/// Identity payload of an INFO response.
///
/// `did` and `pid` identify the device, everything else is advisory.
#[derive(Derivative)]
#[derivative(PartialEq)]
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DeviceInfo {
    #[serde(default)]
    pub did: Option<String>,
    #[serde(default)]
    pub pid: Option<String>,
    #[serde(default)]
    pub dtp: Option<String>,
    #[serde(default)]
    pub mac: Option<String>,
    // The address and signal strength change while the device stays the same.
    #[derivative(PartialEq = "ignore")]
    #[serde(default)]
    pub ip: Option<String>,
    #[derivative(PartialEq = "ignore")]
    #[serde(default)]
    pub rssi: Option<i64>,
    #[serde(default)]
    pub sv: Option<String>,
    #[serde(default)]
    pub hv: Option<String>,
}

/// Line codec for the CozyLife protocol: one JSON object per `\r\n` terminated line.
///
/// Decoding yields the raw trimmed line so that one malformed frame does not end the
/// stream; [`ResponseFrame::parse`] turns it into a frame.
#[derive(Debug)]
pub struct FrameCodec {
    lines: LinesCodec,
}

impl FrameCodec {
    pub fn new() -> Self {
        FrameCodec {
            lines: LinesCodec::new_with_max_length(MAX_FRAME_LENGTH),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = String;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>> {
        loop {
            match self.lines.decode(src)? {
                Some(line) if line.trim().is_empty() => continue,
                line => return Ok(line.map(|line| line.trim().to_string())),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>> {
        loop {
            match self.lines.decode_eof(src)? {
                Some(line) if line.trim().is_empty() => continue,
                line => return Ok(line.map(|line| line.trim().to_string())),
            }
        }
    }
}

impl Encoder<RequestFrame> for FrameCodec {
    type Error = anyhow::Error;

    fn encode(&mut self, frame: RequestFrame, dst: &mut BytesMut) -> Result<()> {
        let line = serde_json::to_string(&frame)?;
        dst.reserve(line.len() + 2);
        dst.put_slice(line.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}
