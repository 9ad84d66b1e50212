//! A deliberately minimal binary framing used by [`crate::driver::RserveDriver`]
//! to talk to a backend compute server over TCP.
//!
//! Spec §1 marks the real wire protocol out of scope ("assumed provided by a
//! lower-level client library"); no such crate exists on crates.io for this
//! vendor protocol, so this module is a small stand-in with just enough
//! shape (a greeting, login, assign, eval, shutdown) for `driver` and
//! `executor` to have something concrete to drive. See `DESIGN.md`.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use crate::error::DriverError;
use crate::value::RValue;

const OP_LOGIN: u8 = 1;
const OP_ASSIGN: u8 = 2;
const OP_EVAL: u8 = 3;
const OP_SHUTDOWN: u8 = 4;

const STATUS_OK: u8 = 0;
const STATUS_ERR: u8 = 1;

const TAG_STR: u8 = 0;
const TAG_STR_VEC: u8 = 1;
const TAG_NUM: u8 = 2;
const TAG_NUM_VEC: u8 = 3;

fn write_frame(stream: &mut TcpStream, opcode: u8, payload: &[u8]) -> io::Result<()> {
    stream.write_all(&[opcode])?;
    stream.write_all(&(payload.len() as u32).to_be_bytes())?;
    stream.write_all(payload)
}

fn read_frame(stream: &mut TcpStream) -> io::Result<(u8, Vec<u8>)> {
    let mut status = [0u8; 1];
    stream.read_exact(&mut status)?;
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    Ok((status[0], payload))
}

fn encode_value(value: &RValue) -> Vec<u8> {
    let mut out = Vec::new();
    match value {
        RValue::Str(s) => {
            out.push(TAG_STR);
            out.extend((s.len() as u32).to_be_bytes());
            out.extend(s.as_bytes());
        }
        RValue::StrVec(items) => {
            out.push(TAG_STR_VEC);
            out.extend((items.len() as u32).to_be_bytes());
            for s in items {
                out.extend((s.len() as u32).to_be_bytes());
                out.extend(s.as_bytes());
            }
        }
        RValue::Num(n) => {
            out.push(TAG_NUM);
            out.extend(n.to_be_bytes());
        }
        RValue::NumVec(items) => {
            out.push(TAG_NUM_VEC);
            out.extend((items.len() as u32).to_be_bytes());
            for n in items {
                out.extend(n.to_be_bytes());
            }
        }
    }
    out
}

/// A read-only cursor over a decode buffer; avoids repeating bounds checks
/// at every call site in `decode_value`.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let slice = self.buf.get(self.pos..self.pos + n)?;
        self.pos += n;
        Some(slice)
    }

    fn take_u8(&mut self) -> Option<u8> {
        Some(self.take(1)?[0])
    }

    fn take_u32(&mut self) -> Option<u32> {
        Some(u32::from_be_bytes(self.take(4)?.try_into().ok()?))
    }

    fn take_f64(&mut self) -> Option<f64> {
        Some(f64::from_be_bytes(self.take(8)?.try_into().ok()?))
    }

    fn take_string(&mut self) -> Option<String> {
        let len = self.take_u32()? as usize;
        String::from_utf8(self.take(len)?.to_vec()).ok()
    }
}

fn decode_value(payload: &[u8]) -> Option<RValue> {
    let mut cur = Cursor::new(payload);
    match cur.take_u8()? {
        TAG_STR => Some(RValue::Str(cur.take_string()?)),
        TAG_STR_VEC => {
            let count = cur.take_u32()?;
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                items.push(cur.take_string()?);
            }
            Some(RValue::StrVec(items))
        }
        TAG_NUM => Some(RValue::Num(cur.take_f64()?)),
        TAG_NUM_VEC => {
            let count = cur.take_u32()?;
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                items.push(cur.take_f64()?);
            }
            Some(RValue::NumVec(items))
        }
        _ => None,
    }
}

/// A live TCP connection to one backend endpoint, speaking the minimal
/// framing above.
#[derive(Debug)]
pub struct TcpConnection {
    stream: TcpStream,
    endpoint_display: String,
    needs_login: bool,
    connected: bool,
}

impl TcpConnection {
    /// Connects to `host:port` and reads the one-byte greeting that tells
    /// us whether login is required.
    pub fn connect(host: &str, port: u16, endpoint_display: String) -> Result<Self, DriverError> {
        let stream = TcpStream::connect((host, port)).map_err(|e| DriverError::Connect {
            endpoint: endpoint_display.clone(),
            message: e.to_string(),
        })?;
        stream.set_nodelay(true).ok();
        stream
            .set_read_timeout(Some(Duration::from_secs(30)))
            .ok();

        let mut greeting = [0u8; 1];
        let mut s = stream
            .try_clone()
            .map_err(|e| DriverError::Connect {
                endpoint: endpoint_display.clone(),
                message: e.to_string(),
            })?;
        s.read_exact(&mut greeting).map_err(|e| DriverError::Connect {
            endpoint: endpoint_display.clone(),
            message: e.to_string(),
        })?;

        Ok(Self {
            stream,
            endpoint_display,
            needs_login: greeting[0] != 0,
            connected: true,
        })
    }

    fn roundtrip(&mut self, opcode: u8, payload: &[u8]) -> Result<Vec<u8>, DriverError> {
        if write_frame(&mut self.stream, opcode, payload).is_err() {
            self.connected = false;
            return Err(DriverError::Transport {
                endpoint: self.endpoint_display.clone(),
                message: "write failed".to_string(),
            });
        }
        match read_frame(&mut self.stream) {
            Ok((STATUS_OK, payload)) => Ok(payload),
            Ok((STATUS_ERR, payload)) => Err(DriverError::Transport {
                endpoint: self.endpoint_display.clone(),
                message: String::from_utf8_lossy(&payload).into_owned(),
            }),
            Ok(_) => Err(DriverError::Transport {
                endpoint: self.endpoint_display.clone(),
                message: "unrecognized status byte".to_string(),
            }),
            Err(e) => {
                self.connected = false;
                Err(DriverError::Transport {
                    endpoint: self.endpoint_display.clone(),
                    message: e.to_string(),
                })
            }
        }
    }
}

impl crate::connection::Connection for TcpConnection {
    fn is_connected(&self) -> bool {
        self.connected
    }

    fn close(&mut self) {
        if self.connected {
            let _ = self.stream.shutdown(Shutdown::Both);
            self.connected = false;
        }
    }

    fn assign(&mut self, name: &str, value: &RValue) -> Result<(), DriverError> {
        let mut payload = (name.len() as u32).to_be_bytes().to_vec();
        payload.extend(name.as_bytes());
        payload.extend(encode_value(value));
        self.roundtrip(OP_ASSIGN, &payload).map(|_| ())
    }

    fn eval(&mut self, expr: &str) -> Result<RValue, DriverError> {
        let payload = self.roundtrip(OP_EVAL, expr.as_bytes())?;
        decode_value(&payload).ok_or_else(|| DriverError::Transport {
            endpoint: self.endpoint_display.clone(),
            message: "malformed response value".to_string(),
        })
    }

    fn login(&mut self, username: &str, password: &str) -> Result<(), DriverError> {
        let mut payload = (username.len() as u32).to_be_bytes().to_vec();
        payload.extend(username.as_bytes());
        payload.extend((password.len() as u32).to_be_bytes());
        payload.extend(password.as_bytes());
        match self.roundtrip(OP_LOGIN, &payload) {
            Ok(_) => {
                self.needs_login = false;
                Ok(())
            }
            Err(DriverError::Transport { endpoint, .. }) => Err(DriverError::Auth { endpoint }),
            Err(other) => Err(other),
        }
    }

    fn needs_login(&self) -> bool {
        self.needs_login
    }
}

impl TcpConnection {
    /// Sends the shutdown opcode without expecting the connection to
    /// survive the round trip; a transport error here is expected and
    /// treated as success by the caller (`driver::RserveDriver::shutdown`).
    pub fn send_shutdown(&mut self) -> Result<(), DriverError> {
        let _ = write_frame(&mut self.stream, OP_SHUTDOWN, &[]);
        self.connected = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_str() {
        let value = RValue::Str("sum".to_string());
        let encoded = encode_value(&value);
        assert_eq!(decode_value(&encoded), Some(value));
    }

    #[test]
    fn round_trips_str_vec() {
        let value = RValue::StrVec(vec!["a".to_string(), "bb".to_string(), String::new()]);
        let encoded = encode_value(&value);
        assert_eq!(decode_value(&encoded), Some(value));
    }

    #[test]
    fn round_trips_num() {
        let value = RValue::Num(17.0);
        let encoded = encode_value(&value);
        assert_eq!(decode_value(&encoded), Some(value));
    }

    #[test]
    fn round_trips_num_vec() {
        let value = RValue::NumVec(vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        let encoded = encode_value(&value);
        assert_eq!(decode_value(&encoded), Some(value));
    }

    #[test]
    fn round_trips_non_finite_num() {
        let value = RValue::NumVec(vec![f64::NAN, f64::INFINITY, f64::NEG_INFINITY]);
        let encoded = encode_value(&value);
        match decode_value(&encoded) {
            Some(RValue::NumVec(v)) => {
                assert!(v[0].is_nan());
                assert_eq!(v[1], f64::INFINITY);
                assert_eq!(v[2], f64::NEG_INFINITY);
            }
            other => panic!("unexpected decode result: {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_truncated_payload() {
        let mut encoded = encode_value(&RValue::Num(1.0));
        encoded.truncate(encoded.len() - 1);
        assert_eq!(decode_value(&encoded), None);
    }

    #[test]
    fn decode_rejects_unknown_tag() {
        assert_eq!(decode_value(&[0xFF]), None);
    }
}
