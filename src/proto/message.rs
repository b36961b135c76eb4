use std::fmt;

use serde::{Deserialize, Serialize};

use super::config::ExperimentConfig;

/// Control codes shared by controller and device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlCode {
    StartConfig,
    StartReq,
    StopReq,
    StopConfig,
    Error,
    EndExperiment,
}

impl ControlCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ControlCode::StartConfig => "START_CONFIG",
            ControlCode::StartReq => "START_REQ",
            ControlCode::StopReq => "STOP_REQ",
            ControlCode::StopConfig => "STOP_CONFIG",
            ControlCode::Error => "ERROR",
            ControlCode::EndExperiment => "END_EXPERIMENT",
        }
    }
}

impl fmt::Display for ControlCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One control message. Only `StartConfig` carries a payload; the others
/// encode as `{"code": ...}` with no `payload` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "code", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    // ---- controller -> device ----
    StartConfig(ExperimentConfig),
    EndExperiment,

    // ---- device -> controller ----
    StartReq,
    StopReq,
    StopConfig,
    Error,
}

impl Message {
    pub fn code(&self) -> ControlCode {
        match self {
            Message::StartConfig(_) => ControlCode::StartConfig,
            Message::EndExperiment => ControlCode::EndExperiment,
            Message::StartReq => ControlCode::StartReq,
            Message::StopReq => ControlCode::StopReq,
            Message::StopConfig => ControlCode::StopConfig,
            Message::Error => ControlCode::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::config::Workload;

    #[test]
    fn unit_codes_have_no_payload() {
        let s = serde_json::to_string(&Message::StopReq).unwrap();
        assert_eq!(s, r#"{"code":"STOP_REQ"}"#);
        let back: Message = serde_json::from_str(&s).unwrap();
        assert_eq!(back, Message::StopReq);
    }

    #[test]
    fn start_config_carries_config() {
        let cfg = ExperimentConfig::new(Workload::Http, "1KB", 0.4);
        let s = serde_json::to_string(&Message::StartConfig(cfg.clone())).unwrap();
        assert!(s.starts_with(r#"{"code":"START_CONFIG","payload":{"#));
        match serde_json::from_str::<Message>(&s).unwrap() {
            Message::StartConfig(back) => assert_eq!(back, cfg),
            other => panic!("wrong variant {other:?}"),
        }
    }

    #[test]
    fn code_matches_wire_tag() {
        for msg in [
            Message::EndExperiment,
            Message::StartReq,
            Message::StopReq,
            Message::StopConfig,
            Message::Error,
        ] {
            let v = serde_json::to_value(&msg).unwrap();
            assert_eq!(v["code"], msg.code().as_str());
        }
    }

    #[test]
    fn unknown_code_rejected() {
        assert!(serde_json::from_str::<Message>(r#"{"code":"HELLO"}"#).is_err());
        // payload-bearing code without payload
        assert!(serde_json::from_str::<Message>(r#"{"code":"START_CONFIG"}"#).is_err());
    }
}
