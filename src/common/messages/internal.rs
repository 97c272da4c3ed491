use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireMessage {
    #[serde(rename = "t", with = "serde_bytes")]
    pub request_id: [u8; 4],

    #[serde(flatten)]
    pub variant: WireMessageVariant,
}

impl WireMessage {
    pub fn from_bytes(bytes: &[u8]) -> Result<WireMessage, serde_bencode::Error> {
        let obj = serde_bencode::from_bytes(bytes)?;
        Ok(obj)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        serde_bencode::to_bytes(self)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "y")]
pub enum WireMessageVariant {
    #[serde(rename = "ping")]
    Ping {
        #[serde(rename = "a")]
        arguments: WirePingArguments,
    },

    #[serde(rename = "pong")]
    Pong {
        #[serde(rename = "a")]
        arguments: WirePongArguments,
    },

    #[serde(rename = "findnode")]
    FindNode {
        #[serde(rename = "a")]
        arguments: WireFindNodeArguments,
    },

    #[serde(rename = "nodes")]
    Nodes {
        #[serde(rename = "a")]
        arguments: WireNodesArguments,
    },

    #[serde(rename = "talkreq")]
    TalkRequest {
        #[serde(rename = "a")]
        arguments: WireTalkRequestArguments,
    },

    #[serde(rename = "talkresp")]
    TalkResponse {
        #[serde(rename = "a")]
        arguments: WireTalkResponseArguments,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WirePingArguments {
    #[serde(rename = "q")]
    pub enr_seq: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WirePongArguments {
    #[serde(rename = "q")]
    pub enr_seq: u64,

    /// Observed ip octets followed by the big endian port.
    #[serde(rename = "ip")]
    pub address: ByteBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireFindNodeArguments {
    #[serde(rename = "d")]
    pub distances: Vec<u16>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireNodesArguments {
    #[serde(rename = "n")]
    pub total: u8,

    #[serde(rename = "r")]
    pub records: Vec<ByteBuf>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireTalkRequestArguments {
    #[serde(rename = "p")]
    pub protocol: ByteBuf,

    #[serde(rename = "v")]
    pub request: ByteBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireTalkResponseArguments {
    #[serde(rename = "v")]
    pub response: ByteBuf,
}
