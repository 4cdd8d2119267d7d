//! Protocol ids used by emews nodes, and the table that declares them.
//!
//! Only the payload shapes are declared here; what each protocol means is up
//! to the application that assigns its handlers.

use super::field::FieldType::{self, Bool, Bytes, U16, U32};
use super::table::{ProtocolId, ProtocolTable};

pub const CLIENT_HEARTBEAT: ProtocolId = ProtocolId(2);

pub const CLIENT_SCENARIO_START: ProtocolId = ProtocolId(70);
pub const CLIENT_SCENARIO_STOP: ProtocolId = ProtocolId(71);

pub const HUB_HUBCONSOLE_WELCOME: ProtocolId = ProtocolId(108);
pub const HUB_LOGGING_MESSAGE: ProtocolId = ProtocolId(110);
pub const HUB_SERVICE_REGISTER: ProtocolId = ProtocolId(120);

pub const HUB_SERVICE_SEND_ALL: ProtocolId = ProtocolId(130);
pub const HUB_SERVICE_SEND_TO: ProtocolId = ProtocolId(131);
pub const HUB_SERVICE_TELL: ProtocolId = ProtocolId(132);
pub const HUB_SERVICE_ASK: ProtocolId = ProtocolId(133);
pub const HUB_SERVICE_ENVKEY_ID: ProtocolId = ProtocolId(134);

pub const HUB_SERVICE_STARTED: ProtocolId = ProtocolId(140);
pub const HUB_SERVICE_STOPPED: ProtocolId = ProtocolId(141);
pub const HUB_SERVICE_SPAWNED: ProtocolId = ProtocolId(142);
pub const HUB_SERVICE_EXITED: ProtocolId = ProtocolId(143);

pub const HUB_CONSOLE_COMMAND: ProtocolId = ProtocolId(150);

pub const HOST_SERVICE_SEND_MSG: ProtocolId = ProtocolId(172);
pub const HOST_SERVICE_LOCAL_REQUEST: ProtocolId = ProtocolId(173);
pub const HOST_SERVICE_SPAWN: ProtocolId = ProtocolId(174);
pub const HOST_SERVICE_START: ProtocolId = ProtocolId(175);
pub const HOST_SERVICE_STOP: ProtocolId = ProtocolId(176);

pub const HUBMON_LOGGING_MESSAGE: ProtocolId = ProtocolId(210);

type Shape = Option<&'static [FieldType]>;

/// (id, request fields, response fields)
const STANDARD_PROTOCOLS: &[(ProtocolId, Shape, Shape)] = &[
    (CLIENT_HEARTBEAT, None, None),
    (CLIENT_SCENARIO_START, None, None),
    (CLIENT_SCENARIO_STOP, None, None),
    (HUB_HUBCONSOLE_WELCOME, None, Some(&[Bytes, Bytes])),
    (HUB_LOGGING_MESSAGE, Some(&[U16, Bytes]), None),
    (HUB_SERVICE_REGISTER, Some(&[Bytes, Bytes]), Some(&[U32, Bytes])),
    (HUB_SERVICE_SEND_ALL, Some(&[U32, Bytes]), None),
    (HUB_SERVICE_SEND_TO, Some(&[U32, Bytes, Bytes]), None),
    (HUB_SERVICE_TELL, Some(&[U32, U16, Bytes]), None),
    (HUB_SERVICE_ASK, Some(&[U32, U16]), Some(&[Bytes])),
    (HUB_SERVICE_ENVKEY_ID, Some(&[Bytes]), Some(&[U16])),
    (HUB_SERVICE_STARTED, Some(&[U32]), None),
    (HUB_SERVICE_STOPPED, Some(&[U32]), None),
    (HUB_SERVICE_SPAWNED, Some(&[U32, Bool]), None),
    (HUB_SERVICE_EXITED, Some(&[U32, Bool]), None),
    (HUB_CONSOLE_COMMAND, Some(&[Bytes]), Some(&[Bytes])),
    (HOST_SERVICE_SEND_MSG, Some(&[U32, U32, Bytes]), None),
    (HOST_SERVICE_LOCAL_REQUEST, Some(&[Bytes, Bytes]), None),
    (HOST_SERVICE_SPAWN, Some(&[Bytes, Bytes, U32, Bytes]), None),
    (HOST_SERVICE_START, Some(&[U32]), None),
    (HOST_SERVICE_STOP, Some(&[U32]), None),
    (HUBMON_LOGGING_MESSAGE, Some(&[U32, Bytes, Bytes]), None),
];

impl ProtocolTable {
    /// Table with every standard emews protocol declared and no handlers.
    pub fn emews() -> Self {
        let mut table = Self::new();
        for &(id, request, response) in STANDARD_PROTOCOLS {
            // Ids in the list are unique, so this cannot fail.
            let _ = table.define_fields(id, request.map(<[_]>::to_vec), response.map(<[_]>::to_vec));
        }
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Category, Value};

    #[test]
    fn test_standard_table_is_complete() {
        let table = ProtocolTable::emews();
        assert_eq!(table.len(), STANDARD_PROTOCOLS.len());
        assert_eq!(table.ids().first(), Some(&CLIENT_HEARTBEAT));
        assert_eq!(table.ids().last(), Some(&HUBMON_LOGGING_MESSAGE));
    }

    #[test]
    fn test_heartbeat_has_no_payload() {
        let table = ProtocolTable::emews();
        let entry = table.get(CLIENT_HEARTBEAT).unwrap();
        assert!(!entry.request_format().has_payload());
        assert!(!entry.response_format().has_payload());
    }

    #[test]
    fn test_ask_shapes() {
        let table = ProtocolTable::emews();
        let entry = table.get(HUB_SERVICE_ASK).unwrap();
        assert_eq!(entry.request_format().category(), Category::Request);
        let packed = entry
            .pack_request(4, &[Value::U32(10), Value::U16(3)])
            .unwrap();
        assert_eq!(packed.len(), 12 + 6);
        let packed = entry.pack_response(4, &[Value::from("answer")]).unwrap();
        assert_eq!(packed.len(), 12 + 4 + 6);
    }
}
