use std::net::{IpAddr, Ipv4Addr};

use chained_beans::broker::DEFAULT_MAX_JOB_SIZE;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub(crate) struct Args {
    /// Address to listen on.
    #[arg(short, long, default_value_t = IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)))]
    pub(crate) listen: IpAddr,
    /// (TCP) port to listen on.
    #[arg(short, long, default_value_t = 11300)]
    pub(crate) port: u16,
    /// Sets the maximum allowed job size.
    #[arg(short = 'z', long, default_value_t = DEFAULT_MAX_JOB_SIZE)]
    pub(crate) max_job_size: u32,
    /// Enables human-friendly logging.
    #[arg(short, long, default_value_t)]
    pub(crate) debug: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["cbeans"]);
        assert_eq!(args.port, 11300);
        assert_eq!(args.max_job_size, 65535);
        assert!(!args.debug);

        let args = Args::parse_from(["cbeans", "-l", "127.0.0.1", "-z", "10"]);
        assert_eq!(args.listen, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(args.max_job_size, 10);
    }
}
