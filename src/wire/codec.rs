use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::wire::protocol::{
    ActionEnvelope, ClientMessage, DecodeError, EncodeError, EventBody, FieldValue, JoinError,
    JoinRequest, JoinResponse, ServerFrame, StateUpdateFrame, StateUpdateWithEvents, WireFormat,
};

/// Opcodes for the compact array format. Fixed for the life of the protocol.
pub const OP_JOIN: i64 = 1;
pub const OP_JOIN_RESPONSE: i64 = 2;
pub const OP_JOIN_ERROR: i64 = 3;
pub const OP_ACTION: i64 = 4;
pub const OP_CLIENT_EVENT: i64 = 5;
pub const OP_STATE_UPDATE: i64 = 6;
pub const OP_STATE_UPDATE_WITH_EVENTS: i64 = 7;
pub const OP_SERVER_EVENT: i64 = 8;

/// Encode one server frame in the given format.
pub fn encode_server_frame(
    frame: &ServerFrame,
    format: WireFormat,
) -> Result<Vec<u8>, EncodeError> {
    match format {
        WireFormat::Text => to_json_bytes(&server_frame_to_object(frame)?),
        WireFormat::Compact => to_json_bytes(&server_frame_to_array(frame)?),
        WireFormat::Binary => encode_binary(frame),
    }
}

/// Decode one server frame. Used by synthetic clients and tests; the server
/// itself only encodes this direction.
pub fn decode_server_frame(bytes: &[u8], format: WireFormat) -> Result<ServerFrame, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    match format {
        WireFormat::Text => server_frame_from_object(&parse_object(bytes)?),
        WireFormat::Compact => server_frame_from_array(&parse_array(bytes)?),
        WireFormat::Binary => decode_binary(bytes),
    }
}

/// Encode one client message. Used by synthetic clients and tests.
pub fn encode_client_message(
    msg: &ClientMessage,
    format: WireFormat,
) -> Result<Vec<u8>, EncodeError> {
    match format {
        WireFormat::Text => to_json_bytes(&client_message_to_object(msg)?),
        WireFormat::Compact => to_json_bytes(&client_message_to_array(msg)?),
        WireFormat::Binary => encode_binary(msg),
    }
}

/// Decode one client message in the given format.
pub fn decode_client_message(
    bytes: &[u8],
    format: WireFormat,
) -> Result<ClientMessage, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    match format {
        WireFormat::Text => client_message_from_object(&parse_object(bytes)?),
        WireFormat::Compact => client_message_from_array(&parse_array(bytes)?),
        WireFormat::Binary => decode_binary(bytes),
    }
}

/// Encode using bincode legacy config (fixed-size integers).
fn encode_binary<T: Serialize>(value: &T) -> Result<Vec<u8>, EncodeError> {
    bincode::serde::encode_to_vec(value, bincode::config::legacy())
        .map_err(|e| EncodeError::Binary(e.to_string()))
}

/// Decode using bincode legacy config (fixed-size integers).
fn decode_binary<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, DecodeError> {
    bincode::serde::decode_from_slice(data, bincode::config::legacy())
        .map(|(msg, _)| msg)
        .map_err(|e| DecodeError::Binary(e.to_string()))
}

fn to_json_bytes(value: &Value) -> Result<Vec<u8>, EncodeError> {
    serde_json::to_vec(value).map_err(|e| EncodeError::Json(e.to_string()))
}

fn parse_json(bytes: &[u8]) -> Result<Value, DecodeError> {
    serde_json::from_slice(bytes).map_err(|e| DecodeError::Json(e.to_string()))
}

fn parse_object(bytes: &[u8]) -> Result<serde_json::Map<String, Value>, DecodeError> {
    match parse_json(bytes)? {
        Value::Object(obj) => Ok(obj),
        other => Err(DecodeError::Malformed(format!(
            "expected object frame, got {}",
            json_kind(&other)
        ))),
    }
}

fn parse_array(bytes: &[u8]) -> Result<Vec<Value>, DecodeError> {
    match parse_json(bytes)? {
        Value::Array(items) => Ok(items),
        other => Err(DecodeError::Malformed(format!(
            "expected array frame, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---- portable text (object) forms ----

fn client_message_to_object(msg: &ClientMessage) -> Result<Value, EncodeError> {
    let mut obj = serde_json::Map::new();
    match msg {
        ClientMessage::Join(join) => {
            obj.insert("type".into(), Value::String("join".into()));
            obj.insert("requestId".into(), join.request_id.into());
            obj.insert("playerId".into(), Value::String(join.player_id.to_string()));
            if let Some(key) = &join.account_key {
                obj.insert("accountKey".into(), Value::String(key.clone()));
            }
            if let Some(name) = &join.display_name {
                obj.insert("displayName".into(), Value::String(name.clone()));
            }
        }
        ClientMessage::Action(action) => {
            obj.insert("type".into(), Value::String("action".into()));
            obj.insert("requestId".into(), action.request_id.into());
            obj.insert("name".into(), Value::String(action.name.clone()));
            obj.insert("args".into(), fields_to_object(&action.args)?);
        }
        ClientMessage::ClientEvent(event) => {
            obj.insert("type".into(), Value::String("clientEvent".into()));
            obj.insert("name".into(), Value::String(event.name.clone()));
            obj.insert("data".into(), fields_to_object(&event.data)?);
        }
    }
    Ok(Value::Object(obj))
}

fn client_message_from_object(
    obj: &serde_json::Map<String, Value>,
) -> Result<ClientMessage, DecodeError> {
    let kind = field_str(obj, "type")?;
    match kind {
        "join" => Ok(ClientMessage::Join(JoinRequest {
            request_id: field_u64(obj, "requestId")?,
            player_id: field_uuid(obj, "playerId")?,
            account_key: optional_str(obj, "accountKey"),
            display_name: optional_str(obj, "displayName"),
        })),
        "action" => Ok(ClientMessage::Action(ActionEnvelope {
            request_id: field_u64(obj, "requestId")?,
            name: field_str(obj, "name")?.to_string(),
            args: fields_from_value(obj.get("args"))?,
        })),
        "clientEvent" => Ok(ClientMessage::ClientEvent(EventBody {
            name: field_str(obj, "name")?.to_string(),
            data: fields_from_value(obj.get("data"))?,
        })),
        other => Err(DecodeError::UnknownKind(other.to_string())),
    }
}

fn server_frame_to_object(frame: &ServerFrame) -> Result<Value, EncodeError> {
    let mut obj = serde_json::Map::new();
    match frame {
        ServerFrame::JoinResponse(resp) => {
            obj.insert("type".into(), Value::String("joinResponse".into()));
            obj.insert("requestId".into(), resp.request_id.into());
            obj.insert("playerId".into(), Value::String(resp.player_id.to_string()));
            obj.insert("playerSlot".into(), Value::Number(resp.player_slot.into()));
            obj.insert("encoding".into(), Value::String(resp.encoding.as_str().into()));
        }
        ServerFrame::JoinError(err) => {
            obj.insert("type".into(), Value::String("joinError".into()));
            obj.insert("requestId".into(), err.request_id.into());
            obj.insert("code".into(), Value::String(err.code.clone()));
            obj.insert("message".into(), Value::String(err.message.clone()));
        }
        ServerFrame::StateUpdate(update) => {
            obj.insert("type".into(), Value::String("stateUpdate".into()));
            state_update_into_object(update, &mut obj)?;
        }
        ServerFrame::StateUpdateWithEvents(combined) => {
            obj.insert("type".into(), Value::String("stateUpdateWithEvents".into()));
            state_update_into_object(&combined.update, &mut obj)?;
            obj.insert("events".into(), events_to_array(&combined.events)?);
        }
        ServerFrame::ServerEvent(event) => {
            obj.insert("type".into(), Value::String("serverEvent".into()));
            obj.insert("name".into(), Value::String(event.name.clone()));
            obj.insert("data".into(), fields_to_object(&event.data)?);
        }
    }
    Ok(Value::Object(obj))
}

fn server_frame_from_object(
    obj: &serde_json::Map<String, Value>,
) -> Result<ServerFrame, DecodeError> {
    let kind = field_str(obj, "type")?;
    match kind {
        "joinResponse" => {
            let encoding = field_str(obj, "encoding")?;
            Ok(ServerFrame::JoinResponse(JoinResponse {
                request_id: field_u64(obj, "requestId")?,
                player_id: field_uuid(obj, "playerId")?,
                player_slot: field_u64(obj, "playerSlot")? as u16,
                encoding: WireFormat::parse(encoding)
                    .ok_or_else(|| DecodeError::Malformed(format!("bad encoding `{encoding}`")))?,
            }))
        }
        "joinError" => Ok(ServerFrame::JoinError(JoinError {
            request_id: field_u64(obj, "requestId")?,
            code: field_str(obj, "code")?.to_string(),
            message: field_str(obj, "message")?.to_string(),
        })),
        "stateUpdate" => Ok(ServerFrame::StateUpdate(state_update_from_object(obj)?)),
        "stateUpdateWithEvents" => Ok(ServerFrame::StateUpdateWithEvents(StateUpdateWithEvents {
            update: state_update_from_object(obj)?,
            events: events_from_value(obj.get("events"))?,
        })),
        "serverEvent" => Ok(ServerFrame::ServerEvent(EventBody {
            name: field_str(obj, "name")?.to_string(),
            data: fields_from_value(obj.get("data"))?,
        })),
        other => Err(DecodeError::UnknownKind(other.to_string())),
    }
}

fn state_update_into_object(
    update: &StateUpdateFrame,
    obj: &mut serde_json::Map<String, Value>,
) -> Result<(), EncodeError> {
    obj.insert("tick".into(), update.tick.into());
    obj.insert("full".into(), Value::Bool(update.full));
    obj.insert("keys".into(), keys_to_object(&update.keys));
    obj.insert("values".into(), values_to_object(&update.values)?);
    obj.insert(
        "removed".into(),
        Value::Array(update.removed.iter().map(|&k| Value::Number(k.into())).collect()),
    );
    Ok(())
}

fn state_update_from_object(
    obj: &serde_json::Map<String, Value>,
) -> Result<StateUpdateFrame, DecodeError> {
    Ok(StateUpdateFrame {
        tick: field_u64(obj, "tick")?,
        full: obj.get("full").and_then(Value::as_bool).unwrap_or(false),
        keys: keys_from_value(obj.get("keys"))?,
        values: values_from_value(obj.get("values"))?,
        removed: removed_from_value(obj.get("removed"))?,
    })
}

// ---- compact (array) forms ----

fn client_message_to_array(msg: &ClientMessage) -> Result<Value, EncodeError> {
    Ok(Value::Array(match msg {
        ClientMessage::Join(join) => vec![
            OP_JOIN.into(),
            join.request_id.into(),
            Value::String(join.player_id.to_string()),
            join.account_key.clone().map(Value::String).unwrap_or(Value::Null),
            join.display_name.clone().map(Value::String).unwrap_or(Value::Null),
        ],
        ClientMessage::Action(action) => vec![
            OP_ACTION.into(),
            action.request_id.into(),
            Value::String(action.name.clone()),
            fields_to_object(&action.args)?,
        ],
        ClientMessage::ClientEvent(event) => vec![
            OP_CLIENT_EVENT.into(),
            Value::String(event.name.clone()),
            fields_to_object(&event.data)?,
        ],
    }))
}

fn client_message_from_array(items: &[Value]) -> Result<ClientMessage, DecodeError> {
    let opcode = array_opcode(items)?;
    match opcode {
        OP_JOIN => Ok(ClientMessage::Join(JoinRequest {
            request_id: item_u64(items, 1)?,
            player_id: item_uuid(items, 2)?,
            account_key: item_optional_str(items, 3),
            display_name: item_optional_str(items, 4),
        })),
        OP_ACTION => Ok(ClientMessage::Action(ActionEnvelope {
            request_id: item_u64(items, 1)?,
            name: item_str(items, 2)?.to_string(),
            args: fields_from_value(items.get(3))?,
        })),
        OP_CLIENT_EVENT => Ok(ClientMessage::ClientEvent(EventBody {
            name: item_str(items, 1)?.to_string(),
            data: fields_from_value(items.get(2))?,
        })),
        other => Err(DecodeError::UnknownOpcode(other)),
    }
}

fn server_frame_to_array(frame: &ServerFrame) -> Result<Value, EncodeError> {
    Ok(Value::Array(match frame {
        ServerFrame::JoinResponse(resp) => vec![
            OP_JOIN_RESPONSE.into(),
            resp.request_id.into(),
            Value::String(resp.player_id.to_string()),
            Value::Number(resp.player_slot.into()),
            Value::String(resp.encoding.as_str().into()),
        ],
        ServerFrame::JoinError(err) => vec![
            OP_JOIN_ERROR.into(),
            err.request_id.into(),
            Value::String(err.code.clone()),
            Value::String(err.message.clone()),
        ],
        ServerFrame::StateUpdate(update) => {
            let mut items = vec![OP_STATE_UPDATE.into()];
            items.extend(state_update_to_items(update)?);
            items
        }
        ServerFrame::StateUpdateWithEvents(combined) => {
            let mut items = vec![OP_STATE_UPDATE_WITH_EVENTS.into()];
            items.extend(state_update_to_items(&combined.update)?);
            items.push(events_to_array(&combined.events)?);
            items
        }
        ServerFrame::ServerEvent(event) => vec![
            OP_SERVER_EVENT.into(),
            Value::String(event.name.clone()),
            fields_to_object(&event.data)?,
        ],
    }))
}

fn server_frame_from_array(items: &[Value]) -> Result<ServerFrame, DecodeError> {
    let opcode = array_opcode(items)?;
    match opcode {
        OP_JOIN_RESPONSE => {
            let encoding = item_str(items, 4)?;
            Ok(ServerFrame::JoinResponse(JoinResponse {
                request_id: item_u64(items, 1)?,
                player_id: item_uuid(items, 2)?,
                player_slot: item_u64(items, 3)? as u16,
                encoding: WireFormat::parse(encoding)
                    .ok_or_else(|| DecodeError::Malformed(format!("bad encoding `{encoding}`")))?,
            }))
        }
        OP_JOIN_ERROR => Ok(ServerFrame::JoinError(JoinError {
            request_id: item_u64(items, 1)?,
            code: item_str(items, 2)?.to_string(),
            message: item_str(items, 3)?.to_string(),
        })),
        OP_STATE_UPDATE => Ok(ServerFrame::StateUpdate(state_update_from_items(items)?)),
        OP_STATE_UPDATE_WITH_EVENTS => Ok(ServerFrame::StateUpdateWithEvents(
            StateUpdateWithEvents {
                update: state_update_from_items(items)?,
                events: events_from_value(items.get(6))?,
            },
        )),
        OP_SERVER_EVENT => Ok(ServerFrame::ServerEvent(EventBody {
            name: item_str(items, 1)?.to_string(),
            data: fields_from_value(items.get(2))?,
        })),
        other => Err(DecodeError::UnknownOpcode(other)),
    }
}

/// Positions 1..=5 of a compact state frame: tick, full, keys, values, removed.
fn state_update_to_items(update: &StateUpdateFrame) -> Result<Vec<Value>, EncodeError> {
    Ok(vec![
        update.tick.into(),
        Value::Bool(update.full),
        keys_to_object(&update.keys),
        values_to_object(&update.values)?,
        Value::Array(update.removed.iter().map(|&k| Value::Number(k.into())).collect()),
    ])
}

fn state_update_from_items(items: &[Value]) -> Result<StateUpdateFrame, DecodeError> {
    Ok(StateUpdateFrame {
        tick: item_u64(items, 1)?,
        full: items.get(2).and_then(Value::as_bool).unwrap_or(false),
        keys: keys_from_value(items.get(3))?,
        values: values_from_value(items.get(4))?,
        removed: removed_from_value(items.get(5))?,
    })
}

// ---- shared field helpers ----

fn fields_to_object(fields: &BTreeMap<String, FieldValue>) -> Result<Value, EncodeError> {
    let mut obj = serde_json::Map::new();
    for (name, value) in fields {
        obj.insert(name.clone(), value.to_json()?);
    }
    Ok(Value::Object(obj))
}

fn fields_from_value(value: Option<&Value>) -> Result<BTreeMap<String, FieldValue>, DecodeError> {
    let mut fields = BTreeMap::new();
    match value {
        None | Some(Value::Null) => {}
        Some(Value::Object(obj)) => {
            for (name, v) in obj {
                fields.insert(name.clone(), FieldValue::from_json(v)?);
            }
        }
        Some(other) => {
            return Err(DecodeError::Malformed(format!(
                "expected field object, got {}",
                json_kind(other)
            )))
        }
    }
    Ok(fields)
}

fn keys_to_object(keys: &[(String, u32)]) -> Value {
    let mut obj = serde_json::Map::new();
    for (path, key) in keys {
        obj.insert(path.clone(), Value::Number((*key).into()));
    }
    Value::Object(obj)
}

fn keys_from_value(value: Option<&Value>) -> Result<Vec<(String, u32)>, DecodeError> {
    let mut keys = Vec::new();
    if let Some(Value::Object(obj)) = value {
        for (path, v) in obj {
            let key = v
                .as_u64()
                .ok_or_else(|| DecodeError::Malformed(format!("bad key id for `{path}`")))?;
            keys.push((path.clone(), key as u32));
        }
    }
    Ok(keys)
}

fn values_to_object(values: &BTreeMap<u32, FieldValue>) -> Result<Value, EncodeError> {
    let mut obj = serde_json::Map::new();
    for (key, value) in values {
        obj.insert(key.to_string(), value.to_json()?);
    }
    Ok(Value::Object(obj))
}

fn values_from_value(value: Option<&Value>) -> Result<BTreeMap<u32, FieldValue>, DecodeError> {
    let mut values = BTreeMap::new();
    if let Some(Value::Object(obj)) = value {
        for (key, v) in obj {
            let key = key
                .parse::<u32>()
                .map_err(|_| DecodeError::Malformed(format!("non-integer value key `{key}`")))?;
            values.insert(key, FieldValue::from_json(v)?);
        }
    }
    Ok(values)
}

fn removed_from_value(value: Option<&Value>) -> Result<Vec<u32>, DecodeError> {
    let mut removed = Vec::new();
    if let Some(Value::Array(items)) = value {
        for item in items {
            let key = item
                .as_u64()
                .ok_or_else(|| DecodeError::Malformed("non-integer removed key".into()))?;
            removed.push(key as u32);
        }
    }
    Ok(removed)
}

fn events_to_array(events: &[EventBody]) -> Result<Value, EncodeError> {
    let mut items = Vec::with_capacity(events.len());
    for event in events {
        items.push(Value::Array(vec![
            Value::String(event.name.clone()),
            fields_to_object(&event.data)?,
        ]));
    }
    Ok(Value::Array(items))
}

fn events_from_value(value: Option<&Value>) -> Result<Vec<EventBody>, DecodeError> {
    let mut events = Vec::new();
    if let Some(Value::Array(items)) = value {
        for item in items {
            let pair = item
                .as_array()
                .ok_or_else(|| DecodeError::Malformed("event entry is not a pair".into()))?;
            let name = pair
                .first()
                .and_then(Value::as_str)
                .ok_or_else(|| DecodeError::Malformed("event entry missing name".into()))?;
            events.push(EventBody {
                name: name.to_string(),
                data: fields_from_value(pair.get(1))?,
            });
        }
    }
    Ok(events)
}

fn field_u64(obj: &serde_json::Map<String, Value>, name: &str) -> Result<u64, DecodeError> {
    obj.get(name)
        .and_then(Value::as_u64)
        .ok_or_else(|| DecodeError::Malformed(format!("missing or non-integer `{name}`")))
}

fn field_str<'a>(
    obj: &'a serde_json::Map<String, Value>,
    name: &str,
) -> Result<&'a str, DecodeError> {
    obj.get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| DecodeError::Malformed(format!("missing or non-string `{name}`")))
}

fn field_uuid(obj: &serde_json::Map<String, Value>, name: &str) -> Result<Uuid, DecodeError> {
    let raw = field_str(obj, name)?;
    Uuid::parse_str(raw).map_err(|_| DecodeError::Malformed(format!("bad uuid in `{name}`")))
}

fn optional_str(obj: &serde_json::Map<String, Value>, name: &str) -> Option<String> {
    obj.get(name).and_then(Value::as_str).map(str::to_string)
}

fn array_opcode(items: &[Value]) -> Result<i64, DecodeError> {
    items
        .first()
        .and_then(Value::as_i64)
        .ok_or_else(|| DecodeError::Malformed("missing opcode".into()))
}

fn item_u64(items: &[Value], idx: usize) -> Result<u64, DecodeError> {
    items
        .get(idx)
        .and_then(Value::as_u64)
        .ok_or_else(|| DecodeError::Malformed(format!("missing or non-integer item {idx}")))
}

fn item_str<'a>(items: &'a [Value], idx: usize) -> Result<&'a str, DecodeError> {
    items
        .get(idx)
        .and_then(Value::as_str)
        .ok_or_else(|| DecodeError::Malformed(format!("missing or non-string item {idx}")))
}

fn item_uuid(items: &[Value], idx: usize) -> Result<Uuid, DecodeError> {
    let raw = item_str(items, idx)?;
    Uuid::parse_str(raw).map_err(|_| DecodeError::Malformed(format!("bad uuid in item {idx}")))
}

fn item_optional_str(items: &[Value], idx: usize) -> Option<String> {
    items.get(idx).and_then(Value::as_str).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::protocol::PlayerId;

    fn sample_join() -> ClientMessage {
        ClientMessage::Join(JoinRequest {
            request_id: 1,
            player_id: PlayerId::new_v4(),
            account_key: Some("acct-1".to_string()),
            display_name: Some("Alice".to_string()),
        })
    }

    fn sample_action() -> ClientMessage {
        let mut args = BTreeMap::new();
        args.insert("path".to_string(), FieldValue::Str("hp".to_string()));
        args.insert("value".to_string(), FieldValue::Int(90));
        ClientMessage::Action(ActionEnvelope {
            request_id: 7,
            name: "set".to_string(),
            args,
        })
    }

    fn sample_state_update() -> ServerFrame {
        let mut values = BTreeMap::new();
        values.insert(0, FieldValue::Int(5));
        values.insert(1, FieldValue::Int(90));
        ServerFrame::StateUpdate(StateUpdateFrame {
            tick: 5,
            full: false,
            keys: vec![("tick".to_string(), 0), ("hp".to_string(), 1)],
            values,
            removed: vec![2],
        })
    }

    #[test]
    fn test_client_message_roundtrip_all_formats() {
        for format in [WireFormat::Text, WireFormat::Compact, WireFormat::Binary] {
            for msg in [
                sample_join(),
                sample_action(),
                ClientMessage::ClientEvent(EventBody::new("ping").with("seq", 3i64)),
            ] {
                let encoded = encode_client_message(&msg, format).unwrap();
                let decoded = decode_client_message(&encoded, format).unwrap();
                assert_eq!(decoded, msg, "format {format}");
            }
        }
    }

    #[test]
    fn test_server_frame_roundtrip_all_formats() {
        let mut values = BTreeMap::new();
        values.insert(3, FieldValue::List(vec![FieldValue::Int(1), FieldValue::Float(0.5)]));
        let frames = vec![
            ServerFrame::JoinResponse(JoinResponse {
                request_id: 1,
                player_id: PlayerId::new_v4(),
                player_slot: 4,
                encoding: WireFormat::Binary,
            }),
            ServerFrame::JoinError(JoinError {
                request_id: 2,
                code: "room_full".to_string(),
                message: "no free slots".to_string(),
            }),
            sample_state_update(),
            ServerFrame::StateUpdateWithEvents(StateUpdateWithEvents {
                update: StateUpdateFrame {
                    tick: 9,
                    full: false,
                    keys: vec![("score".to_string(), 3)],
                    values,
                    removed: vec![],
                },
                events: vec![EventBody::new("explosion").with("x", 4i64)],
            }),
            ServerFrame::ServerEvent(EventBody::new("whisper").with("text", "hi")),
        ];
        for format in [WireFormat::Text, WireFormat::Compact, WireFormat::Binary] {
            for frame in &frames {
                let encoded = encode_server_frame(frame, format).unwrap();
                let decoded = decode_server_frame(&encoded, format).unwrap();
                assert_eq!(&decoded, frame, "format {format}");
            }
        }
    }

    #[test]
    fn test_portable_join_shape() {
        let encoded = encode_client_message(&sample_join(), WireFormat::Text).unwrap();
        let value: Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(value["type"], "join");
        assert_eq!(value["requestId"], 1);
        assert!(value["playerId"].is_string());
        assert_eq!(value["displayName"], "Alice");
    }

    #[test]
    fn test_compact_layout_leading_opcode() {
        let encoded = encode_client_message(&sample_action(), WireFormat::Compact).unwrap();
        let value: Value = serde_json::from_slice(&encoded).unwrap();
        let items = value.as_array().unwrap();
        assert_eq!(items[0], Value::from(OP_ACTION));
        assert_eq!(items[2], "set");

        let encoded = encode_server_frame(&sample_state_update(), WireFormat::Compact).unwrap();
        let value: Value = serde_json::from_slice(&encoded).unwrap();
        let items = value.as_array().unwrap();
        assert_eq!(items[0], Value::from(OP_STATE_UPDATE));
        assert_eq!(items[1], 5); // tick
        assert_eq!(items[3]["hp"], 1); // key declaration
        assert_eq!(items[4]["1"], 90); // value by integer key
    }

    #[test]
    fn test_binary_frames_never_look_like_text() {
        // Enum frames start with a little-endian u32 variant tag, so the first
        // byte is a small integer and text-shape detection cannot misfire.
        let frames = [
            encode_server_frame(&sample_state_update(), WireFormat::Binary).unwrap(),
            encode_client_message(&sample_action(), WireFormat::Binary).unwrap(),
            encode_client_message(&sample_join(), WireFormat::Binary).unwrap(),
        ];
        for bytes in frames {
            assert!(bytes[0] < 16);
            assert_ne!(bytes[0], b'{');
            assert_ne!(bytes[0], b'[');
        }
    }

    #[test]
    fn test_unknown_kind_and_opcode() {
        let raw = br#"{"type":"teleport","requestId":1}"#;
        match decode_client_message(raw, WireFormat::Text) {
            Err(DecodeError::UnknownKind(kind)) => assert_eq!(kind, "teleport"),
            other => panic!("expected unknown kind, got {other:?}"),
        }

        let raw = br#"[99, 1]"#;
        match decode_client_message(raw, WireFormat::Compact) {
            Err(DecodeError::UnknownOpcode(op)) => assert_eq!(op, 99),
            other => panic!("expected unknown opcode, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_frames() {
        assert!(matches!(
            decode_client_message(b"", WireFormat::Text),
            Err(DecodeError::Empty)
        ));
        assert!(matches!(
            decode_client_message(b"not json", WireFormat::Text),
            Err(DecodeError::Json(_))
        ));
        // Wrong shape for the format.
        assert!(matches!(
            decode_client_message(br#"[1, 2]"#, WireFormat::Text),
            Err(DecodeError::Malformed(_))
        ));
        // Garbage bytes under binary.
        assert!(matches!(
            decode_client_message(&[0xFF, 0xFE, 0xFD], WireFormat::Binary),
            Err(DecodeError::Binary(_))
        ));
        // Missing required field.
        assert!(matches!(
            decode_client_message(br#"{"type":"join"}"#, WireFormat::Text),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_join_response_always_decodable_as_text() {
        let frame = ServerFrame::JoinResponse(JoinResponse {
            request_id: 3,
            player_id: PlayerId::new_v4(),
            player_slot: 0,
            encoding: WireFormat::Binary,
        });
        let encoded = encode_server_frame(&frame, WireFormat::Text).unwrap();
        let decoded = decode_server_frame(&encoded, WireFormat::Text).unwrap();
        match decoded {
            ServerFrame::JoinResponse(resp) => assert_eq!(resp.encoding, WireFormat::Binary),
            other => panic!("wrong frame type: {other:?}"),
        }
    }

    #[test]
    fn test_deterministic_encoding() {
        let frame = sample_state_update();
        for format in [WireFormat::Text, WireFormat::Compact, WireFormat::Binary] {
            let a = encode_server_frame(&frame, format).unwrap();
            let b = encode_server_frame(&frame, format).unwrap();
            assert_eq!(a, b);
        }
    }
}
