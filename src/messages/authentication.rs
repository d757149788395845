//! Login messages sent and received through the installed cipher.

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientResponseEncrypted {
    #[prost(message, required, tag = "10")]
    pub login_credentials: LoginCredentials,
    #[prost(message, required, tag = "50")]
    pub system_info: SystemInfo,
    #[prost(string, optional, tag = "70")]
    pub version_string: Option<String>,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct LoginCredentials {
    #[prost(string, optional, tag = "10")]
    pub username: Option<String>,
    #[prost(enumeration = "AuthenticationType", required, tag = "20")]
    pub typ: i32,
    #[prost(bytes = "vec", optional, tag = "30")]
    pub auth_data: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SystemInfo {
    #[prost(enumeration = "CpuFamily", required, tag = "10")]
    pub cpu_family: i32,
    #[prost(enumeration = "Os", required, tag = "60")]
    pub os: i32,
    #[prost(string, optional, tag = "90")]
    pub system_information_string: Option<String>,
    #[prost(string, optional, tag = "100")]
    pub device_id: Option<String>,
}

/// Identity record returned by the access point on successful login.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApWelcome {
    #[prost(string, required, tag = "10")]
    pub canonical_username: String,
    #[prost(enumeration = "AccountType", required, tag = "20")]
    pub account_type_logged_in: i32,
    #[prost(enumeration = "AccountType", required, tag = "25")]
    pub credentials_type_logged_in: i32,
    #[prost(enumeration = "AuthenticationType", required, tag = "30")]
    pub reusable_auth_credentials_type: i32,
    #[prost(bytes = "vec", required, tag = "40")]
    pub reusable_auth_credentials: Vec<u8>,
    #[prost(bytes = "vec", optional, tag = "50")]
    pub lfs_secret: Option<Vec<u8>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum AuthenticationType {
    UserPass = 0,
    StoredSpotifyCredentials = 1,
    StoredFacebookCredentials = 2,
    SpotifyToken = 3,
    FacebookToken = 4,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum AccountType {
    Spotify = 0,
    Facebook = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum CpuFamily {
    Unknown = 0,
    X86 = 1,
    X8664 = 2,
    Arm = 6,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Os {
    Unknown = 0,
    Windows = 1,
    Osx = 2,
    Linux = 4,
}
