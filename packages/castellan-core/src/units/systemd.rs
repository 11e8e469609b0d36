//! Init-system bus implementation of [`InitBus`].
//!
//! One instance per scope: the system manager lives on the system bus, the
//! user manager on the session bus. Signal subscription requires an
//! explicit `Subscribe` call before the manager emits anything.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use zbus::zvariant::{OwnedObjectPath, OwnedValue, Value};
use zbus::{Connection, MatchRule, MessageStream, Proxy};

use crate::error::{CastellanError, CastellanResult};

use super::bus::{InitBus, UnitSignal, UnitStatus};
use super::UnitScope;

const MANAGER_DESTINATION: &str = "org.freedesktop.systemd1";
const MANAGER_PATH: &str = "/org/freedesktop/systemd1";
const MANAGER_INTERFACE: &str = "org.freedesktop.systemd1.Manager";
const UNIT_INTERFACE: &str = "org.freedesktop.systemd1.Unit";
const UNIT_PATH_PREFIX: &str = "/org/freedesktop/systemd1/unit/";

/// Capacity of the decoded signal channel.
const SIGNAL_CHANNEL_CAPACITY: usize = 64;

/// One row of the manager's bulk unit listing.
type UnitRow = (
    String,          // name
    String,          // description
    String,          // load state
    String,          // active state
    String,          // sub state
    String,          // followed unit
    OwnedObjectPath, // unit object path
    u32,             // job id
    String,          // job type
    OwnedObjectPath, // job object path
);

/// Init-system client for one scope.
pub struct SystemdBus {
    conn: Connection,
    manager: Proxy<'static>,
    timeout: Duration,
}

impl SystemdBus {
    /// Connects to the bus matching `scope`.
    pub async fn connect(scope: UnitScope, timeout: Duration) -> CastellanResult<Self> {
        let conn = match scope {
            UnitScope::System => Connection::system().await?,
            UnitScope::User => Connection::session().await?,
        };
        let manager = Proxy::new(
            &conn,
            MANAGER_DESTINATION,
            MANAGER_PATH,
            MANAGER_INTERFACE,
        )
        .await?;
        Ok(Self {
            conn,
            manager,
            timeout,
        })
    }

    async fn with_deadline<T, E>(
        &self,
        fut: impl Future<Output = Result<T, E>>,
    ) -> CastellanResult<T>
    where
        E: Into<CastellanError>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(CastellanError::Timeout),
        }
    }

    async fn unit_file_state(&self, name: &str) -> String {
        // Units without an installable unit file make this call fail; that
        // simply means "not enabled".
        self.with_deadline(
            self.manager
                .call::<_, _, String>("GetUnitFileState", &(name,)),
        )
        .await
        .unwrap_or_default()
    }

    async fn job_call(&self, method: &str, name: &str) -> CastellanResult<()> {
        self.with_deadline(
            self.manager
                .call::<_, _, OwnedObjectPath>(method, &(name, "replace")),
        )
        .await
        .map(|_| ())
    }

    async fn reload(&self) -> CastellanResult<()> {
        self.with_deadline(self.manager.call::<_, _, ()>("Reload", &()))
            .await
    }
}

#[async_trait]
impl InitBus for SystemdBus {
    async fn list_units(&self, names: &[String]) -> CastellanResult<Vec<UnitStatus>> {
        let rows: Vec<UnitRow> = self
            .with_deadline(self.manager.call("ListUnitsByNames", &(names,)))
            .await?;

        let mut units = Vec::with_capacity(rows.len());
        for (name, description, load_state, active_state, sub_state, ..) in rows {
            let unit_file_state = self.unit_file_state(&name).await;
            units.push(UnitStatus {
                exists: load_state != "not-found",
                name,
                description,
                active_state,
                sub_state,
                unit_file_state,
            });
        }
        Ok(units)
    }

    async fn unit_status(&self, name: &str) -> CastellanResult<UnitStatus> {
        let names = vec![name.to_string()];
        let mut units = self.list_units(&names).await?;
        if units.is_empty() {
            return Err(CastellanError::Upstream(format!(
                "init system returned no status for {name}"
            )));
        }
        Ok(units.remove(0))
    }

    async fn start_unit(&self, name: &str) -> CastellanResult<()> {
        self.job_call("StartUnit", name).await
    }

    async fn stop_unit(&self, name: &str) -> CastellanResult<()> {
        self.job_call("StopUnit", name).await
    }

    async fn restart_unit(&self, name: &str) -> CastellanResult<()> {
        self.job_call("RestartUnit", name).await
    }

    async fn enable_unit(&self, name: &str) -> CastellanResult<()> {
        let names = vec![name.to_string()];
        self.with_deadline(
            self.manager
                .call::<_, _, (bool, Vec<(String, String, String)>)>(
                    "EnableUnitFiles",
                    &(&names, false, true),
                ),
        )
        .await?;
        self.reload().await
    }

    async fn disable_unit(&self, name: &str) -> CastellanResult<()> {
        let names = vec![name.to_string()];
        self.with_deadline(
            self.manager
                .call::<_, _, Vec<(String, String, String)>>(
                    "DisableUnitFiles",
                    &(&names, false),
                ),
        )
        .await?;
        self.reload().await
    }

    async fn signals(&self) -> CastellanResult<mpsc::Receiver<UnitSignal>> {
        // The manager stays silent until somebody subscribes.
        self.with_deadline(self.manager.call::<_, _, ()>("Subscribe", &()))
            .await?;

        let rule = MatchRule::builder()
            .msg_type(zbus::message::Type::Signal)
            .sender(MANAGER_DESTINATION)?
            .interface("org.freedesktop.DBus.Properties")?
            .member("PropertiesChanged")?
            .build();
        let mut stream =
            MessageStream::for_match_rule(rule, &self.conn, Some(SIGNAL_CHANNEL_CAPACITY)).await?;

        let (tx, rx) = mpsc::channel(SIGNAL_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let Ok(message) = message else { break };
                let Some(signal) = parse_unit_signal(&message) else {
                    continue;
                };
                if tx.send(signal).await.is_err() {
                    break;
                }
            }
            log::debug!("[Units] signal pump stopped");
        });
        Ok(rx)
    }
}

/// Extracts the unit name and new sub-state from a properties-changed
/// signal on a unit object path.
fn parse_unit_signal(message: &zbus::Message) -> Option<UnitSignal> {
    let header = message.header();
    let path = header.path()?.as_str().to_string();
    let encoded = path.strip_prefix(UNIT_PATH_PREFIX)?;
    let unit = decode_unit_name(encoded);

    let body = message.body();
    let (interface, changed, _invalidated): (String, HashMap<String, OwnedValue>, Vec<String>) =
        body.deserialize().ok()?;
    if interface != UNIT_INTERFACE {
        return None;
    }

    let sub_state = changed.get("SubState").and_then(|value| {
        let value: &Value = value;
        if let Value::Str(s) = value {
            Some(s.as_str().to_string())
        } else {
            None
        }
    });
    Some(UnitSignal { unit, sub_state })
}

/// Decodes an init-system object path segment into a canonical unit name.
///
/// Every `_XX` (two hex digits) becomes the corresponding byte; all other
/// bytes pass through, e.g. `spotifyd_2eservice` -> `spotifyd.service`.
pub fn decode_unit_name(encoded: &str) -> String {
    let bytes = encoded.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'_'
            && i + 2 < bytes.len()
            && bytes[i + 1].is_ascii_hexdigit()
            && bytes[i + 2].is_ascii_hexdigit()
        {
            let hex = [bytes[i + 1], bytes[i + 2]];
            let hex = std::str::from_utf8(&hex).expect("hex digits are ascii");
            decoded.push(u8::from_str_radix(hex, 16).expect("checked hex digits"));
            i += 3;
        } else {
            decoded.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

/// Encodes a unit name into an object path segment (the inverse of
/// [`decode_unit_name`]): everything except ASCII alphanumerics becomes
/// `_XX`.
pub fn encode_unit_name(name: &str) -> String {
    let mut encoded = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("_{byte:02x}"));
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_hex_escaped_segments() {
        assert_eq!(decode_unit_name("spotifyd_2eservice"), "spotifyd.service");
        assert_eq!(
            decode_unit_name("dbus_2dbroker_2eservice"),
            "dbus-broker.service"
        );
        assert_eq!(decode_unit_name("plain"), "plain");
    }

    #[test]
    fn decode_leaves_incomplete_escapes_alone() {
        assert_eq!(decode_unit_name("a_2"), "a_2");
        assert_eq!(decode_unit_name("a_zz"), "a_zz");
        assert_eq!(decode_unit_name("trailing_"), "trailing_");
    }

    #[test]
    fn encode_then_decode_round_trips_unit_names() {
        for name in [
            "spotifyd.service",
            "dbus-broker.service",
            "foo_bar.service",
            "unit@instance.service",
            "weird name.service",
        ] {
            assert_eq!(decode_unit_name(&encode_unit_name(name)), name);
        }
    }
}
