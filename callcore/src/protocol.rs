//! JSON envelopes exchanged with the signaling relay.
//!
//! Every envelope carries a `type` discriminator. Outbound envelopes name the
//! peer in `target`; the relay rewrites that to `from` before forwarding, so
//! inbound and outbound shapes are separate types.

use serde::{Deserialize, Serialize};

use crate::identity::UserCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// A session description in the browser `RTCSessionDescriptionInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    #[serde(default)]
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    /// The ICE username fragment, taken from the first `a=ice-ufrag:` line.
    pub fn ice_ufrag(&self) -> Option<&str> {
        self.sdp
            .lines()
            .find_map(|line| line.strip_prefix("a=ice-ufrag:"))
            .map(str::trim)
            .filter(|ufrag| !ufrag.is_empty())
    }
}

/// A network-path candidate in the browser `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OutboundMessage {
    CallOffer {
        target: UserCode,
        offer: SessionDescription,
    },
    CallAnswer {
        target: UserCode,
        answer: SessionDescription,
    },
    CallCandidate {
        target: UserCode,
        candidate: IceCandidate,
    },
    CallReject {
        target: UserCode,
    },
    CallEnd {
        target: UserCode,
    },
}

impl OutboundMessage {
    pub fn target(&self) -> &UserCode {
        match self {
            OutboundMessage::CallOffer { target, .. }
            | OutboundMessage::CallAnswer { target, .. }
            | OutboundMessage::CallCandidate { target, .. }
            | OutboundMessage::CallReject { target }
            | OutboundMessage::CallEnd { target } => target,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::CallOffer { .. } => "call-offer",
            OutboundMessage::CallAnswer { .. } => "call-answer",
            OutboundMessage::CallCandidate { .. } => "call-candidate",
            OutboundMessage::CallReject { .. } => "call-reject",
            OutboundMessage::CallEnd { .. } => "call-end",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum InboundMessage {
    CallOffer {
        from: UserCode,
        offer: SessionDescription,
    },
    CallAnswer {
        from: UserCode,
        answer: SessionDescription,
    },
    CallCandidate {
        from: UserCode,
        candidate: IceCandidate,
    },
    CallReject {
        from: UserCode,
    },
    CallEnd {
        from: UserCode,
    },
    Error {
        message: String,
    },
    /// Result of the remote recognition service; never interpreted here.
    TranslationResult {
        #[serde(default)]
        label: serde_json::Value,
    },
}

impl InboundMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::CallOffer { .. } => "call-offer",
            InboundMessage::CallAnswer { .. } => "call-answer",
            InboundMessage::CallCandidate { .. } => "call-candidate",
            InboundMessage::CallReject { .. } => "call-reject",
            InboundMessage::CallEnd { .. } => "call-end",
            InboundMessage::Error { .. } => "error",
            InboundMessage::TranslationResult { .. } => "translation-result",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn code(s: &str) -> UserCode {
        s.parse().unwrap()
    }

    #[test]
    fn outbound_offer_uses_target_and_type_tag() {
        let msg = OutboundMessage::CallOffer {
            target: code("ZZ99XX"),
            offer: SessionDescription::offer("v=0\r\n"),
        };
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "call-offer",
                "target": "ZZ99XX",
                "offer": { "type": "offer", "sdp": "v=0\r\n" }
            })
        );
    }

    #[test]
    fn ice_ufrag_is_read_from_the_sdp() {
        let desc = SessionDescription::answer(
            "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=ice-ufrag:Xk3p\r\na=ice-pwd:secret\r\n",
        );
        assert_eq!(desc.ice_ufrag(), Some("Xk3p"));
        assert_eq!(SessionDescription::offer("v=0\r\n").ice_ufrag(), None);
    }

    #[test]
    fn outbound_candidate_matches_browser_shape() {
        let msg = OutboundMessage::CallCandidate {
            target: code("AB12CD"),
            candidate: IceCandidate::new("candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host"),
        };
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "call-candidate");
        assert_eq!(value["candidate"]["sdpMid"], "0");
        assert_eq!(value["candidate"]["sdpMLineIndex"], 0);
        assert!(value["candidate"].get("usernameFragment").is_none());
    }

    #[test]
    fn reject_and_end_carry_only_target() {
        let reject = OutboundMessage::CallReject {
            target: code("AB12CD"),
        };
        assert_eq!(
            serde_json::to_value(&reject).unwrap(),
            json!({ "type": "call-reject", "target": "AB12CD" })
        );
        let end = OutboundMessage::CallEnd {
            target: code("AB12CD"),
        };
        assert_eq!(end.kind(), "call-end");
        assert_eq!(end.target().as_str(), "AB12CD");
    }

    #[test]
    fn inbound_envelopes_dispatch_on_type() {
        let offer = InboundMessage::parse(
            r#"{"type":"call-offer","from":"AB12CD","offer":{"type":"offer","sdp":"x"}}"#,
        )
        .unwrap();
        assert_eq!(
            offer,
            InboundMessage::CallOffer {
                from: code("AB12CD"),
                offer: SessionDescription::offer("x"),
            }
        );

        let candidate = InboundMessage::parse(
            r#"{"type":"call-candidate","from":"AB12CD","candidate":{"candidate":"c","sdpMid":"0","sdpMLineIndex":0}}"#,
        )
        .unwrap();
        assert_eq!(candidate.kind(), "call-candidate");

        let error = InboundMessage::parse(r#"{"type":"error","message":"offline"}"#).unwrap();
        assert_eq!(
            error,
            InboundMessage::Error {
                message: "offline".to_string()
            }
        );
    }

    #[test]
    fn translation_result_label_is_opaque() {
        let msg =
            InboundMessage::parse(r#"{"type":"translation-result","label":{"text":"hello","score":0.9}}"#)
                .unwrap();
        match msg {
            InboundMessage::TranslationResult { label } => {
                assert_eq!(label["text"], "hello");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_or_malformed_envelopes_fail_to_parse() {
        assert!(InboundMessage::parse(r#"{"type":"presence","from":"AB12CD"}"#).is_err());
        assert!(InboundMessage::parse("not json").is_err());
        assert!(InboundMessage::parse(r#"{"type":"call-answer","from":"AB12CD"}"#).is_err());
    }
}
