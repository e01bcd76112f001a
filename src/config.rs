use std::{
    net::{IpAddr, Ipv4Addr},
    path::PathBuf,
};

use clap::Parser;

// CLI configuration for the SRP server.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct ApplicationConfig {
    /// Address to listen for SSH connections.
    #[arg(
        long,
        default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        value_name = "ADDRESS"
    )]
    pub listen_address: IpAddr,

    /// Port to listen for SSH connections.
    #[arg(long, default_value_t = 2222, value_name = "PORT")]
    pub ssh_port: u16,

    /// File path to the server's secret key. If missing, it will be created
    /// for you.
    #[arg(long, default_value_os = "./deploy/server_keys/ssh", value_name = "FILE")]
    pub private_key_file: PathBuf,

    /// Directory where endpoint sockets are created.
    /// If unset, a temporary directory is used instead.
    #[arg(long, value_name = "DIRECTORY")]
    pub unix_directory: Option<PathBuf>,
}

#[cfg(test)]
mod config_tests {
    use std::{net::IpAddr, path::PathBuf};

    use clap::Parser;

    use super::ApplicationConfig;

    #[test]
    fn parses_defaults() {
        let config = ApplicationConfig::parse_from(["srp"]);
        assert_eq!(config.listen_address, "0.0.0.0".parse::<IpAddr>().unwrap());
        assert_eq!(config.ssh_port, 2222);
        assert_eq!(config.unix_directory, None);
    }

    #[test]
    fn parses_overrides() {
        let config = ApplicationConfig::parse_from([
            "srp",
            "--listen-address=127.0.0.1",
            "--ssh-port=18022",
            "--private-key-file=/tmp/host_key",
            "--unix-directory=/run/srp",
        ]);
        assert_eq!(config.listen_address, "127.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(config.ssh_port, 18022);
        assert_eq!(config.private_key_file, PathBuf::from("/tmp/host_key"));
        assert_eq!(config.unix_directory, Some(PathBuf::from("/run/srp")));
    }
}
