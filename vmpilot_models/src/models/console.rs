//! Console envelope exchanged with WebSocket clients
//!
//! ```json
//! {"type": "server", "message": "login: "}
//! ```

pub const SERVER: &str = "server";
pub const CLIENT: &str = "client";

/// One chunk of console traffic. `kind` is `server` for bytes read from the
/// guest console and `client` for keystrokes typed by the user; any other
/// value is tolerated on input and ignored by the relay.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

impl Envelope {
    pub fn server(message: String) -> Envelope {
        Envelope {
            kind: SERVER.to_string(),
            message,
        }
    }

    pub fn client(message: String) -> Envelope {
        Envelope {
            kind: CLIENT.to_string(),
            message,
        }
    }

    pub fn is_client(&self) -> bool {
        self.kind == CLIENT
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Envelope> {
        serde_json::from_str(text)
    }
}
