//! Various signer-wide constants.

use std::time::Duration;


//------------ Binary Names -------------------------------------------------

/// The friendly name of the `signerd` binary.
pub const SIGNER_SERVER_APP: &str = "Token Signer";

/// The friendly name of the `signerc` binary.
pub const SIGNER_CLIENT_APP: &str = "Token Signer Client";

/// The user agent used by the client and the OCSP fetcher.
pub const SIGNER_USER_AGENT: &str = "tokensigner";


//------------ Config Files Paths -------------------------------------------

/// The default path to the signer config file.
pub const SIGNER_DEFAULT_CONFIG_FILE: &str = "/etc/tokensigner.conf";


//------------ Environment Variables ----------------------------------------

/// The environment variable with the log level.
///
/// The variable should contain the name of a [`log::LevelFilter`]. It will
/// be overwritten by the config file. The default is “info.”
pub const SIGNER_ENV_LOG_LEVEL: &str = "SIGNER_LOG_LEVEL";

/// The environment variable with the log target.
///
/// The variable should contain the name of a
/// [`LogType`][crate::config::LogType]. It will be overwritten by the
/// config file. The default is “file.”
pub const SIGNER_ENV_LOG_TYPE: &str = "SIGNER_LOG_TYPE";

/// The environment variable holding the RPC bearer token.
pub const SIGNER_ENV_AUTH_TOKEN: &str = "SIGNER_AUTH_TOKEN";

/// The environment variable telling the client to only print API calls.
pub const SIGNER_CLI_API_ENV: &str = "SIGNER_CLI_API";


//------------ Tokens -------------------------------------------------------

/// The identifier of the software token.
///
/// The gateway proxy uses this token for its TLS key, so the value is part
/// of the wire contract and must not change.
pub const SOFTWARE_TOKEN_ID: &str = "0";

/// The module name under which the software token is discovered.
pub const SOFTWARE_MODULE_NAME: &str = "softToken";

/// The label reported for the software token.
pub const SOFTWARE_TOKEN_LABEL: &str = "softToken-0";


//------------ Storage ------------------------------------------------------

/// Sub-directory of the data dir holding the registry metadata.
pub const REGISTRY_DIR: &str = "registry";

/// File name of the persisted registry.
pub const REGISTRY_FILE: &str = "registry.json";

/// Sub-directory of the data dir holding the software token.
pub const SOFT_TOKEN_DIR: &str = "softtoken";

/// Sub-directory of the software token holding the encrypted keys.
pub const KEYS_DIR: &str = "keys";

/// Name of the lock file used to serialize registry writes.
pub const LOCK_FILE_NAME: &str = "lockfile.lock";


//------------ Faults -------------------------------------------------------

/// Prefix of every fault code sent to RPC clients.
pub const FAULT_CODE_PREFIX: &str = "Signer";


//------------ Crypto -------------------------------------------------------

/// The size of generated RSA keys.
pub const RSA_KEY_BITS: u32 = 2048;

/// The number of random bytes in a generated key identifier.
pub const KEY_ID_BYTES: usize = 20;

/// PBKDF2 iterations for the software token PIN verifier.
pub const PIN_VERIFIER_ITERATIONS: usize = 100_000;

/// Validity of certificates issued through `sign-certificate`.
pub const SIGNED_CERT_VALIDITY_DAYS: i64 = 365;


//------------ HTTP ---------------------------------------------------------

/// The path prefix under which the RPC operations live.
pub const RPC_PATH_PREFIX: &str = "rpc";

/// The RPC protocol version path segment.
pub const RPC_VERSION: &str = "v1";

/// Content type of OCSP requests sent to responders.
pub const OCSP_REQUEST_CONTENT_TYPE: &str = "application/ocsp-request";

/// Tolerated clock difference to responders, in seconds.
pub const OCSP_CLOCK_SKEW_SECS: u32 = 300;

/// Time to wait between discovery attempts of an unreachable HSM.
pub const HSM_PROBE_INTERVAL: Duration = Duration::from_secs(30);
