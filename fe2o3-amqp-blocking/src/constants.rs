//! Constants shared across the crate

use std::time::Duration;

/// Default port for plain AMQP
pub const AMQP_PORT: u16 = 5672;

/// Default port for AMQP over TLS
pub const AMQPS_PORT: u16 = 5671;

/// Default max-frame-size offered in `open`
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 256 * 1024;

/// The smallest max-frame-size a peer is allowed to offer
pub const MIN_MAX_FRAME_SIZE: u32 = 512;

/// Default channel-max offered in `open`
pub const DEFAULT_CHANNEL_MAX: u16 = 255;

/// Default idle timeout offered in `open`
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default incoming window of a session
pub const DEFAULT_INCOMING_WINDOW: u32 = 1;

/// Default outgoing window of a session
pub const DEFAULT_OUTGOING_WINDOW: u32 = 1;

/// Default handle-max of a session
pub const DEFAULT_HANDLE_MAX: u32 = u32::MAX;

/// Default link credit issued by a receiver
pub const DEFAULT_LINK_CREDIT: u32 = 1;

/// A cached token expiring within this margin is refreshed before use
pub const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

/* -------------------------- Claims-based security ------------------------- */

/// Address of the CBS node
pub const CBS_NODE_ADDR: &str = "$cbs";

/// Token type of a JSON web token
pub const JWT_TOKEN_TYPE: &str = "jwt";

/// Token type of a shared access signature
pub const SAS_TOKEN_TYPE: &str = "servicebus.windows.net:sastoken";
