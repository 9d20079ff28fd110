use serde::{Deserialize, Serialize};
use std::fmt;

/// 摄像头流类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    Rtsp,
    Hls,
    Mjpeg,
}

/// 网络摄像头地址信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpCamera {
    pub ip_address: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub rtsp_path: Option<String>,
}

impl IpCamera {
    pub fn new(ip_address: impl Into<String>) -> Self {
        Self {
            ip_address: ip_address.into(),
            username: None,
            password: None,
            rtsp_path: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_rtsp_path(mut self, path: impl Into<String>) -> Self {
        self.rtsp_path = Some(path.into());
        self
    }

    /// 组装流地址
    ///
    /// 目前只支持RTSP，其他类型返回 `None`。
    pub fn compose_stream_url(&self, stream_type: StreamType) -> Option<StreamLocator> {
        match stream_type {
            StreamType::Rtsp => {
                let credentials = match (&self.username, &self.password) {
                    (Some(user), Some(pass)) => format!("{}:{}@", user, pass),
                    (Some(user), None) => format!("{}@", user),
                    _ => String::new(),
                };
                let path = self.rtsp_path.as_deref().unwrap_or("");
                Some(StreamLocator::new(format!(
                    "rtsp://{}{}{}",
                    credentials, self.ip_address, path
                )))
            }
            StreamType::Hls | StreamType::Mjpeg => None,
        }
    }
}

/// 不透明的流连接串
///
/// `Display` 会隐藏其中的口令，日志里只应该打印 `Display` 形式。
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamLocator(String);

impl StreamLocator {
    pub fn new(locator: impl Into<String>) -> Self {
        Self(locator.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn scheme(&self) -> Option<&str> {
        self.0.split_once("://").map(|(scheme, _)| scheme)
    }

    pub fn redacted(&self) -> String {
        let Some((scheme, rest)) = self.0.split_once("://") else {
            return self.0.clone();
        };
        let (authority, path) = match rest.find('/') {
            Some(idx) => rest.split_at(idx),
            None => (rest, ""),
        };
        match authority.rsplit_once('@') {
            Some((userinfo, host)) => match userinfo.split_once(':') {
                Some((user, _)) => format!("{}://{}:***@{}{}", scheme, user, host, path),
                None => self.0.clone(),
            },
            None => self.0.clone(),
        }
    }
}

impl fmt::Display for StreamLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

impl fmt::Debug for StreamLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamLocator({})", self.redacted())
    }
}
