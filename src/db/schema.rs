//! Database schema definitions

pub const CREATE_CONNECTIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS connections (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    ip TEXT NOT NULL,
    port INTEGER NOT NULL,
    country TEXT NOT NULL DEFAULT 'Unknown',
    city TEXT NOT NULL DEFAULT 'Unknown',
    lat REAL NOT NULL DEFAULT 0,
    lon REAL NOT NULL DEFAULT 0,
    client_banner TEXT,
    auth_attempts INTEGER NOT NULL DEFAULT 0,
    duration REAL NOT NULL DEFAULT 0
)
"#;

pub const CREATE_CREDENTIALS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS credentials (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    connection_id INTEGER NOT NULL,
    username TEXT NOT NULL,
    password TEXT NOT NULL,
    FOREIGN KEY (connection_id) REFERENCES connections(id)
)
"#;

// For unique-ip counts and the location breakdown
pub const CREATE_INDEX_IP: &str =
    "CREATE INDEX IF NOT EXISTS idx_connections_ip ON connections(ip)";

// For the duplicate check during migration
pub const CREATE_INDEX_IDENTITY: &str =
    "CREATE INDEX IF NOT EXISTS idx_connections_identity ON connections(timestamp, ip, port)";

pub const CREATE_INDEX_CREDENTIALS_CONNECTION: &str =
    "CREATE INDEX IF NOT EXISTS idx_credentials_connection ON credentials(connection_id)";

pub const INSERT_CONNECTION: &str = r#"
INSERT INTO connections (timestamp, ip, port, country, city, lat, lon, client_banner, auth_attempts, duration)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#;

pub const INSERT_CREDENTIAL: &str =
    "INSERT INTO credentials (connection_id, username, password) VALUES (?, ?, ?)";
