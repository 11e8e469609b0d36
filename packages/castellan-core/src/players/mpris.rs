//! Session-bus implementation of [`PlayerBus`].
//!
//! Wire notes: incoming properties-changed signals carry the sender's
//! transient unique id (`:1.107`), not its well-known name; translation to
//! the well-known name happens in the backend via its owner index. This
//! module only types the payloads.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use zbus::names::InterfaceName;
use zbus::zvariant::{OwnedValue, Value};
use zbus::{fdo, Connection, MatchRule, MessageStream, Proxy};

use crate::config::MprisConfig;
use crate::error::{CastellanError, CastellanResult};

use super::bus::PlayerBus;
use super::types::{
    LoopStatus, PlaybackStatus, Player, PlayerProperty, PlayerSignal, TransportCommand,
    PLAYER_APP_INTERFACE, PLAYER_BUS_PREFIX, PLAYER_INTERFACE, PLAYER_OBJECT_PATH,
};

/// Capacity of the typed signal channel handed to the watcher.
const SIGNAL_CHANNEL_CAPACITY: usize = 64;

/// Session-bus client for media players.
pub struct MprisBus {
    conn: Connection,
    timeout: Duration,
}

impl MprisBus {
    /// Connects to the session bus.
    ///
    /// Failing to reach the bus is an eager health-check failure: the
    /// backend cannot operate without it, so the error bubbles.
    pub async fn connect(config: &MprisConfig) -> CastellanResult<Self> {
        let conn = Connection::session().await?;
        Ok(Self {
            conn,
            timeout: Duration::from_secs(config.timeout),
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

    async fn player_proxy(&self, bus_name: &str) -> CastellanResult<Proxy<'static>> {
        let proxy = Proxy::new(
            &self.conn,
            bus_name.to_string(),
            PLAYER_OBJECT_PATH,
            PLAYER_INTERFACE,
        )
        .await?;
        Ok(proxy)
    }

    async fn get_all(
        &self,
        bus_name: &str,
        interface: &'static str,
    ) -> CastellanResult<HashMap<String, OwnedValue>> {
        let proxy = fdo::PropertiesProxy::builder(&self.conn)
            .destination(bus_name.to_string())?
            .path(PLAYER_OBJECT_PATH)?
            .build()
            .await?;
        self.with_deadline(proxy.get_all(InterfaceName::from_static_str_unchecked(interface)))
            .await
    }
}

#[async_trait]
impl PlayerBus for MprisBus {
    async fn list_player_names(&self) -> CastellanResult<Vec<String>> {
        let proxy = fdo::DBusProxy::new(&self.conn).await?;
        let names = self.with_deadline(proxy.list_names()).await?;
        Ok(names
            .into_iter()
            .map(|name| name.to_string())
            .filter(|name| name.starts_with(PLAYER_BUS_PREFIX))
            .collect())
    }

    async fn name_owner(&self, bus_name: &str) -> CastellanResult<String> {
        let proxy = fdo::DBusProxy::new(&self.conn).await?;
        let name = zbus::names::BusName::try_from(bus_name.to_string())
            .map_err(|e| CastellanError::Upstream(e.to_string()))?;
        let owner = self.with_deadline(proxy.get_name_owner(name)).await?;
        Ok(owner.to_string())
    }

    async fn load_player(&self, bus_name: &str) -> CastellanResult<Player> {
        // Two round trips: one bulk read per interface.
        let app = self.get_all(bus_name, PLAYER_APP_INTERFACE).await?;
        let props = self.get_all(bus_name, PLAYER_INTERFACE).await?;

        let mut player = Player {
            bus_name: bus_name.to_string(),
            identity: app
                .get("Identity")
                .and_then(|value| as_string(value))
                .unwrap_or_else(|| bus_name.to_string()),
            rate: 1.0,
            volume: 1.0,
            ..Player::default()
        };
        for (name, value) in &props {
            if let Some(property) = typed_property(name, value) {
                apply_property(&mut player, property);
            }
        }
        Ok(player)
    }

    async fn position(&self, bus_name: &str) -> CastellanResult<i64> {
        let proxy = self.player_proxy(bus_name).await?;
        self.with_deadline(proxy.get_property::<i64>("Position"))
            .await
    }

    async fn transport(&self, bus_name: &str, command: TransportCommand) -> CastellanResult<()> {
        let proxy = self.player_proxy(bus_name).await?;
        self.with_deadline(proxy.call::<_, _, ()>(command.method(), &()))
            .await
    }

    async fn seek(&self, bus_name: &str, offset_us: i64) -> CastellanResult<()> {
        let proxy = self.player_proxy(bus_name).await?;
        self.with_deadline(proxy.call::<_, _, ()>("Seek", &(offset_us,)))
            .await
    }

    async fn set_position(
        &self,
        bus_name: &str,
        track_id: &str,
        position_us: i64,
    ) -> CastellanResult<()> {
        let path = zbus::zvariant::ObjectPath::try_from(track_id.to_string())
            .map_err(|e| CastellanError::Validation {
                field: "track_id",
                message: e.to_string(),
            })?;
        let proxy = self.player_proxy(bus_name).await?;
        self.with_deadline(proxy.call::<_, _, ()>("SetPosition", &(path, position_us)))
            .await
    }

    async fn set_volume(&self, bus_name: &str, volume: f64) -> CastellanResult<()> {
        let proxy = self.player_proxy(bus_name).await?;
        self.with_deadline(proxy.set_property("Volume", volume))
            .await
    }

    async fn set_loop_status(&self, bus_name: &str, status: LoopStatus) -> CastellanResult<()> {
        let proxy = self.player_proxy(bus_name).await?;
        self.with_deadline(proxy.set_property("LoopStatus", status.as_str()))
            .await
    }

    async fn set_shuffle(&self, bus_name: &str, shuffle: bool) -> CastellanResult<()> {
        let proxy = self.player_proxy(bus_name).await?;
        self.with_deadline(proxy.set_property("Shuffle", shuffle))
            .await
    }

    async fn signals(&self) -> CastellanResult<mpsc::Receiver<PlayerSignal>> {
        let (tx, rx) = mpsc::channel(SIGNAL_CHANNEL_CAPACITY);

        let dbus_proxy = fdo::DBusProxy::new(&self.conn).await?;
        let mut owner_stream = dbus_proxy.receive_name_owner_changed().await?;

        let rule = MatchRule::builder()
            .msg_type(zbus::message::Type::Signal)
            .interface("org.freedesktop.DBus.Properties")?
            .member("PropertiesChanged")?
            .path(PLAYER_OBJECT_PATH)?
            .build();
        let mut property_stream =
            MessageStream::for_match_rule(rule, &self.conn, Some(SIGNAL_CHANNEL_CAPACITY)).await?;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    signal = owner_stream.next() => {
                        let Some(signal) = signal else { break };
                        let Ok(args) = signal.args() else { continue };
                        let name = args.name().to_string();
                        if !name.starts_with(PLAYER_BUS_PREFIX) {
                            continue;
                        }
                        let old_owner = args
                            .old_owner()
                            .as_ref()
                            .map(|owner| owner.to_string())
                            .unwrap_or_default();
                        let new_owner = args
                            .new_owner()
                            .as_ref()
                            .map(|owner| owner.to_string())
                            .unwrap_or_default();
                        if tx
                            .send(PlayerSignal::NameOwnerChanged { name, old_owner, new_owner })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    message = property_stream.next() => {
                        let Some(Ok(message)) = message else { break };
                        let Some(signal) = parse_properties_changed(&message) else { continue };
                        if tx.send(signal).await.is_err() {
                            break;
                        }
                    }
                }
            }
            log::debug!("[Mpris] signal pump stopped");
        });

        Ok(rx)
    }
}

/// Extracts a typed signal from a raw properties-changed message.
///
/// Returns `None` for foreign interfaces and payloads with no recognised
/// property.
fn parse_properties_changed(message: &zbus::Message) -> Option<PlayerSignal> {
    let header = message.header();
    let sender = header.sender()?.to_string();

    let body = message.body();
    let (interface, changed, _invalidated): (String, HashMap<String, OwnedValue>, Vec<String>) =
        body.deserialize().ok()?;
    if interface != PLAYER_INTERFACE {
        return None;
    }

    let properties: Vec<PlayerProperty> = changed
        .iter()
        .filter_map(|(name, value)| typed_property(name, value))
        .collect();
    if properties.is_empty() {
        return None;
    }
    Some(PlayerSignal::PropertiesChanged { sender, properties })
}

/// Maps one named property value to its typed form.
///
/// Unrecognised names and malformed values are ignored; the cache keeps its
/// previous value for them.
pub(crate) fn typed_property(name: &str, value: &OwnedValue) -> Option<PlayerProperty> {
    let value: &Value = value;
    match name {
        "PlaybackStatus" => {
            PlaybackStatus::parse(as_str(value)?).map(PlayerProperty::PlaybackStatus)
        }
        "LoopStatus" => LoopStatus::parse(as_str(value)?).map(PlayerProperty::LoopStatus),
        "Shuffle" => as_bool(value).map(PlayerProperty::Shuffle),
        "Volume" => as_f64(value).map(PlayerProperty::Volume),
        "Position" => as_i64(value).map(PlayerProperty::Position),
        "Rate" => as_f64(value).map(PlayerProperty::Rate),
        "Metadata" => Some(PlayerProperty::Metadata(flatten_metadata(value))),
        "CanPlay" => as_bool(value).map(|v| PlayerProperty::Capability("CanPlay", v)),
        "CanPause" => as_bool(value).map(|v| PlayerProperty::Capability("CanPause", v)),
        "CanGoNext" => as_bool(value).map(|v| PlayerProperty::Capability("CanGoNext", v)),
        "CanGoPrevious" => as_bool(value).map(|v| PlayerProperty::Capability("CanGoPrevious", v)),
        "CanSeek" => as_bool(value).map(|v| PlayerProperty::Capability("CanSeek", v)),
        "CanControl" => as_bool(value).map(|v| PlayerProperty::Capability("CanControl", v)),
        _ => None,
    }
}

/// Applies one typed property to a player record, in place.
pub(crate) fn apply_property(player: &mut Player, property: PlayerProperty) {
    match property {
        PlayerProperty::PlaybackStatus(status) => player.playback_status = status,
        PlayerProperty::LoopStatus(status) => player.loop_status = status,
        PlayerProperty::Shuffle(shuffle) => player.shuffle = shuffle,
        PlayerProperty::Volume(volume) => player.volume = volume,
        PlayerProperty::Position(position) => player.position = position,
        PlayerProperty::Rate(rate) => player.rate = rate,
        PlayerProperty::Metadata(metadata) => player.metadata = metadata,
        PlayerProperty::Capability(name, value) => {
            let capabilities = &mut player.capabilities;
            match name {
                "CanPlay" => capabilities.can_play = value,
                "CanPause" => capabilities.can_pause = value,
                "CanGoNext" => capabilities.can_go_next = value,
                "CanGoPrevious" => capabilities.can_go_previous = value,
                "CanSeek" => capabilities.can_seek = value,
                "CanControl" => capabilities.can_control = value,
                _ => {}
            }
        }
    }
}

fn as_str<'a>(value: &'a Value) -> Option<&'a str> {
    if let Value::Str(s) = value {
        Some(s.as_str())
    } else {
        None
    }
}

fn as_string(value: &Value) -> Option<String> {
    as_str(value).map(str::to_string)
}

fn as_bool(value: &Value) -> Option<bool> {
    if let Value::Bool(v) = value {
        Some(*v)
    } else {
        None
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    if let Value::F64(v) = value {
        Some(*v)
    } else {
        None
    }
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::I64(v) => Some(*v),
        Value::I32(v) => Some(i64::from(*v)),
        Value::U32(v) => Some(i64::from(*v)),
        _ => None,
    }
}

/// Flattens the metadata dictionary into string values.
///
/// Array values (e.g. artist lists) are joined with `, `; unrepresentable
/// values are dropped.
fn flatten_metadata(value: &Value) -> BTreeMap<String, String> {
    let mut flat = BTreeMap::new();
    let Value::Dict(dict) = value else {
        return flat;
    };
    for (key, entry) in dict.iter() {
        let Some(key) = as_string(key) else { continue };
        let entry = unwrap_variant(entry);
        if let Some(text) = scalar_to_string(entry) {
            flat.insert(key, text);
        }
    }
    flat
}

/// Unwraps variant nesting (`v` inside `a{sv}`).
fn unwrap_variant<'a>(value: &'a Value<'a>) -> &'a Value<'a> {
    if let Value::Value(inner) = value {
        inner
    } else {
        value
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Str(s) => Some(s.as_str().to_string()),
        Value::Bool(v) => Some(v.to_string()),
        Value::U8(v) => Some(v.to_string()),
        Value::I16(v) => Some(v.to_string()),
        Value::U16(v) => Some(v.to_string()),
        Value::I32(v) => Some(v.to_string()),
        Value::U32(v) => Some(v.to_string()),
        Value::I64(v) => Some(v.to_string()),
        Value::U64(v) => Some(v.to_string()),
        Value::F64(v) => Some(v.to_string()),
        Value::ObjectPath(path) => Some(path.to_string()),
        Value::Array(array) => {
            let items: Vec<String> = array
                .iter()
                .filter_map(|item| scalar_to_string(unwrap_variant(item)))
                .collect();
            if items.is_empty() {
                None
            } else {
                Some(items.join(", "))
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_property_recognises_playback_status() {
        let value = OwnedValue::try_from(Value::from("Playing")).unwrap();
        match typed_property("PlaybackStatus", &value) {
            Some(PlayerProperty::PlaybackStatus(PlaybackStatus::Playing)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn typed_property_ignores_unknown_names_and_bad_values() {
        let value = OwnedValue::try_from(Value::from("Playing")).unwrap();
        assert!(typed_property("SomethingElse", &value).is_none());
        let wrong = OwnedValue::try_from(Value::from(3.5f64)).unwrap();
        assert!(typed_property("PlaybackStatus", &wrong).is_none());
    }

    #[test]
    fn apply_property_updates_capabilities_in_place() {
        let mut player = Player::default();
        apply_property(&mut player, PlayerProperty::Capability("CanGoNext", true));
        apply_property(&mut player, PlayerProperty::Volume(0.4));
        assert!(player.capabilities.can_go_next);
        assert!((player.volume - 0.4).abs() < f64::EPSILON);
    }

    #[test]
    fn scalar_to_string_joins_arrays() {
        let value = Value::from(vec!["a", "b"]);
        assert_eq!(scalar_to_string(&value), Some("a, b".to_string()));
    }
}
