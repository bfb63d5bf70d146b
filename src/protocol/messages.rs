//! Protobuf envelope exchanged with the gateway's embedded controller.
//!
//! The message layout is small and stable, so the types are declared directly with
//! prost derives instead of being generated from `.proto` files at build time.

/// Top level message: the addressed envelope plus the trailing sequence marker.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
    #[prost(message, optional, tag = "1")]
    pub message: Option<MessageEnvelope>,
    #[prost(message, optional, tag = "2")]
    pub tail: Option<Tail>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MessageEnvelope {
    #[prost(int32, tag = "1")]
    pub delivery_channel: i32,
    #[prost(message, optional, tag = "2")]
    pub sender: Option<Participant>,
    #[prost(message, optional, tag = "3")]
    pub recipient: Option<Participant>,
    #[prost(message, optional, tag = "15")]
    pub config: Option<ConfigPayload>,
    #[prost(message, optional, tag = "16")]
    pub payload: Option<QueryPayload>,
}

/// Sender or recipient of an envelope.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Participant {
    #[prost(oneof = "participant::Id", tags = "1, 2, 3, 4")]
    pub id: Option<participant::Id>,
}

pub mod participant {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Id {
        /// Device identity string of the gateway.
        #[prost(string, tag = "1")]
        Din(String),
        #[prost(int32, tag = "2")]
        TeslaService(i32),
        /// Local client on the gateway's own network.
        #[prost(int32, tag = "3")]
        Local(i32),
        #[prost(int32, tag = "4")]
        AuthorizedClient(i32),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConfigPayload {
    #[prost(oneof = "config_payload::Config", tags = "1, 2")]
    pub config: Option<config_payload::Config>,
}

pub mod config_payload {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Config {
        #[prost(message, tag = "1")]
        Send(super::ConfigSend),
        #[prost(message, tag = "2")]
        Recv(super::ConfigRecv),
    }
}

/// Request for a named configuration file.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConfigSend {
    #[prost(int32, tag = "1")]
    pub num: i32,
    #[prost(string, tag = "2")]
    pub file: String,
}

/// Returned configuration file and its signature.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConfigRecv {
    #[prost(message, optional, tag = "1")]
    pub file: Option<ConfigFile>,
    #[prost(bytes = "vec", tag = "2")]
    pub code: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConfigFile {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "100")]
    pub text: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueryPayload {
    #[prost(message, optional, tag = "1")]
    pub send: Option<QuerySend>,
    #[prost(message, optional, tag = "2")]
    pub recv: Option<QueryText>,
}

/// Status query: query text, signed binary code and JSON variables.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QuerySend {
    #[prost(int32, optional, tag = "1")]
    pub num: Option<i32>,
    #[prost(message, optional, tag = "2")]
    pub payload: Option<QueryText>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub code: Option<Vec<u8>>,
    #[prost(message, optional, tag = "4")]
    pub b: Option<StringValue>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueryText {
    #[prost(int32, tag = "1")]
    pub value: i32,
    #[prost(string, tag = "2")]
    pub text: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StringValue {
    #[prost(string, tag = "1")]
    pub value: String,
}

/// Sequence marker the response must echo.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Tail {
    #[prost(int32, tag = "1")]
    pub value: i32,
}
