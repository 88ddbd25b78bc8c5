//! Typed protocol messages
//!
//! Every envelope tag maps to one [`Message`] variant with a fixed,
//! positional payload. [`Message::decode`] turns a raw envelope into a typed
//! variant before anything is dispatched.

use crate::codec::{Reader, Writer};
use crate::envelope::Envelope;
use crate::error::{LinkError, Result};
use crate::protocol::action::{ActionCommand, SimulatedAction};
use crate::types::{Quat, Role, SyncDirection, Transform, UserIdentity, Vec3};

/// Envelope tags of the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageTag {
    RequestUdpHost,
    ReplyUdpHost,
    LoginRole,
    ChangeDirection,
    SyncTransform,
    SyncRegistration,
    Registration,
    Action,
    ActionSimulation,
    HeadsetHeader,
    Data,
    ActionRecord,
}

impl MessageTag {
    pub const ALL: [MessageTag; 12] = [
        MessageTag::RequestUdpHost,
        MessageTag::ReplyUdpHost,
        MessageTag::LoginRole,
        MessageTag::ChangeDirection,
        MessageTag::SyncTransform,
        MessageTag::SyncRegistration,
        MessageTag::Registration,
        MessageTag::Action,
        MessageTag::ActionSimulation,
        MessageTag::HeadsetHeader,
        MessageTag::Data,
        MessageTag::ActionRecord,
    ];

    /// Tag string on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageTag::RequestUdpHost => "RequestUdpHost",
            MessageTag::ReplyUdpHost => "ReplyUdpHost",
            MessageTag::LoginRole => "LoginRole",
            MessageTag::ChangeDirection => "ChangeDirection",
            MessageTag::SyncTransform => "SyncTransform",
            MessageTag::SyncRegistration => "SyncRegistration",
            MessageTag::Registration => "Registration",
            MessageTag::Action => "Action",
            MessageTag::ActionSimulation => "ActionSimulation",
            MessageTag::HeadsetHeader => "MsgHL2Header",
            MessageTag::Data => "Data",
            MessageTag::ActionRecord => "ActionRecord",
        }
    }

    /// Look up a tag string
    pub fn from_wire(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|tag| tag.as_str() == s)
    }
}

impl std::fmt::Display for MessageTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Full pose of one entity, as streamed over the datagram channel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformUpdate {
    pub id: i32,
    pub transform: Transform,
}

/// Registration result for one object
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub object_id: i32,
    pub object_name: String,
    pub position: Vec3,
}

/// Recorded trajectory of a source object towards a target object
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRecording {
    pub source_id: i32,
    pub source_name: String,
    pub target_id: i32,
    pub target_name: String,
    pub samples: Vec<(Vec3, Quat)>,
}

/// Size in bytes of one recorded sample on the wire
const SAMPLE_LEN: usize = 7 * 4;

/// A decoded protocol message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    RequestUdpHost(UserIdentity),
    ReplyUdpHost { ip: String, port: i32 },
    LoginRole { user: UserIdentity, role: Role },
    ChangeDirection { user: UserIdentity, direction: SyncDirection },
    SyncTransform(TransformUpdate),
    SyncRegistration(Registration),
    Registration(Registration),
    Action(ActionCommand),
    ActionSimulation(SimulatedAction),
    /// Object name and flag relayed from the headset (`MsgHL2Header`)
    HeadsetHeader { name: String, flag: bool },
    /// Tagged vector, e.g. the `ICEOffset`
    Data { tag: String, value: Vec3 },
    ActionRecord(ActionRecording),
}

impl Message {
    /// Tag this message travels under
    pub fn tag(&self) -> MessageTag {
        match self {
            Message::RequestUdpHost(_) => MessageTag::RequestUdpHost,
            Message::ReplyUdpHost { .. } => MessageTag::ReplyUdpHost,
            Message::LoginRole { .. } => MessageTag::LoginRole,
            Message::ChangeDirection { .. } => MessageTag::ChangeDirection,
            Message::SyncTransform(_) => MessageTag::SyncTransform,
            Message::SyncRegistration(_) => MessageTag::SyncRegistration,
            Message::Registration(_) => MessageTag::Registration,
            Message::Action(_) => MessageTag::Action,
            Message::ActionSimulation(_) => MessageTag::ActionSimulation,
            Message::HeadsetHeader { .. } => MessageTag::HeadsetHeader,
            Message::Data { .. } => MessageTag::Data,
            Message::ActionRecord(_) => MessageTag::ActionRecord,
        }
    }

    /// Serialize into an envelope
    ///
    /// Fails only when a string or sample count does not fit its `i32`
    /// prefix.
    pub fn encode(&self) -> Result<Envelope> {
        let mut w = Writer::new();
        match self {
            Message::RequestUdpHost(user) => {
                w.write_i32(user.id).write_str(&user.name);
            }
            Message::ReplyUdpHost { ip, port } => {
                w.write_str(ip).write_i32(*port);
            }
            Message::LoginRole { user, role } => {
                w.write_i32(user.id).write_str(&user.name).write_str(role.as_str());
            }
            Message::ChangeDirection { user, direction } => {
                let (c2s, s2c) = direction.flags();
                w.write_i32(user.id)
                    .write_str(&user.name)
                    .write_bool(c2s)
                    .write_bool(s2c);
            }
            Message::SyncTransform(update) => {
                w.write_i32(update.id)
                    .write_vec3(update.transform.position)
                    .write_vec3(update.transform.rotation)
                    .write_vec3(update.transform.scale);
            }
            Message::SyncRegistration(reg) | Message::Registration(reg) => {
                w.write_i32(reg.object_id)
                    .write_str(&reg.object_name)
                    .write_vec3(reg.position);
            }
            Message::Action(command) => {
                w.write_str(&command.to_wire());
            }
            Message::ActionSimulation(action) => {
                w.write_i32(action.code());
            }
            Message::HeadsetHeader { name, flag } => {
                w.write_str(name).write_bool(*flag);
            }
            Message::Data { tag, value } => {
                w.write_str(tag).write_vec3(*value);
            }
            Message::ActionRecord(rec) => {
                w.write_i32(rec.source_id)
                    .write_str(&rec.source_name)
                    .write_i32(rec.target_id)
                    .write_str(&rec.target_name)
                    .write_len(rec.samples.len());
                for (position, rotation) in &rec.samples {
                    w.write_vec3(*position).write_quat(*rotation);
                }
            }
        }
        Ok(Envelope::new(self.tag().as_str(), w.finish()?))
    }

    /// Decode an envelope into a typed message
    ///
    /// Unknown tags, truncated payloads and out-of-vocabulary actions are
    /// errors; callers discard them.
    pub fn decode(envelope: &Envelope) -> Result<Self> {
        let tag = MessageTag::from_wire(&envelope.tag)
            .ok_or_else(|| LinkError::UnknownTag(envelope.tag.clone()))?;
        let mut r = Reader::new(&envelope.payload);
        Self::decode_payload(tag, &mut r)
            .ok_or_else(|| LinkError::Malformed(tag.as_str().to_string()))?
    }

    fn decode_payload(tag: MessageTag, r: &mut Reader<'_>) -> Option<Result<Self>> {
        let message = match tag {
            MessageTag::RequestUdpHost => {
                Message::RequestUdpHost(UserIdentity::new(r.read_i32()?, r.read_string()?))
            }
            MessageTag::ReplyUdpHost => Message::ReplyUdpHost {
                ip: r.read_string()?,
                port: r.read_i32()?,
            },
            MessageTag::LoginRole => Message::LoginRole {
                user: UserIdentity::new(r.read_i32()?, r.read_string()?),
                role: Role::from_wire(&r.read_string()?),
            },
            MessageTag::ChangeDirection => {
                let user = UserIdentity::new(r.read_i32()?, r.read_string()?);
                let direction = SyncDirection::from_flags(r.read_bool()?, r.read_bool()?)?;
                Message::ChangeDirection { user, direction }
            }
            MessageTag::SyncTransform => Message::SyncTransform(TransformUpdate {
                id: r.read_i32()?,
                transform: Transform {
                    position: r.read_vec3()?,
                    rotation: r.read_vec3()?,
                    scale: r.read_vec3()?,
                },
            }),
            MessageTag::SyncRegistration => Message::SyncRegistration(read_registration(r)?),
            MessageTag::Registration => Message::Registration(read_registration(r)?),
            MessageTag::Action => {
                return Some(ActionCommand::parse(&r.read_string()?).map(Message::Action));
            }
            MessageTag::ActionSimulation => {
                return Some(SimulatedAction::from_code(r.read_i32()?).map(Message::ActionSimulation));
            }
            MessageTag::HeadsetHeader => Message::HeadsetHeader {
                name: r.read_string()?,
                flag: r.read_bool()?,
            },
            MessageTag::Data => Message::Data {
                tag: r.read_string()?,
                value: r.read_vec3()?,
            },
            MessageTag::ActionRecord => Message::ActionRecord(read_recording(r)?),
        };
        Some(Ok(message))
    }
}

fn read_registration(r: &mut Reader<'_>) -> Option<Registration> {
    Some(Registration {
        object_id: r.read_i32()?,
        object_name: r.read_string()?,
        position: r.read_vec3()?,
    })
}

fn read_recording(r: &mut Reader<'_>) -> Option<ActionRecording> {
    let source_id = r.read_i32()?;
    let source_name = r.read_string()?;
    let target_id = r.read_i32()?;
    let target_name = r.read_string()?;
    let count = usize::try_from(r.read_i32()?).ok()?;
    // Never trust the count beyond what the payload can hold
    if count > r.remaining() / SAMPLE_LEN {
        return None;
    }
    let mut samples = Vec::with_capacity(count);
    for _ in 0..count {
        samples.push((r.read_vec3()?, r.read_quat()?));
    }
    Some(ActionRecording {
        source_id,
        source_name,
        target_id,
        target_name,
        samples,
    })
}
