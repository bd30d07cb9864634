//! SCTP throughput test, server and client in one binary. Without a target
//! address it accepts connections and measures what it receives; with one it
//! connects and sends.

use clap::{Arg, Command};

use sctp_socketapi::api::types::{BindxFlags, Linger, SocketOption};
use sctp_socketapi::{self as sctp, SocketAddress};

use std::process::exit;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const DEFAULT_LENGTH: usize = 1024;
const DEFAULT_NUMBER_OF_MESSAGES: u64 = 1024;
const DEFAULT_PORT: u16 = 5001;
const BUFFER_SIZE: usize = 1 << 16;
const LINGER_TIME: u32 = 1000;

fn unix_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs_f64()
}

fn handle_connection(fd: i32, verbose: bool, peer: Option<SocketAddress>) {
    if verbose {
        match peer {
            Some(peer) => println!("Connection accepted from {peer}"),
            None => println!("Connection accepted"),
        }
    }
    let mut buf = vec![0u8; BUFFER_SIZE];
    let start_wall = unix_seconds();
    let start = Instant::now();
    let mut sum: u64 = 0;
    let mut messages: u64 = 0;
    let mut length = 0;

    loop {
        match sctp::recv(fd, &mut buf, 0) {
            Ok(0) => break,
            Ok(n) => {
                if length == 0 {
                    length = n;
                }
                sum += n as u64;
                messages += 1;
            }
            Err(e) => {
                eprintln!("recv: {e}");
                break;
            }
        }
    }
    let seconds = start.elapsed().as_secs_f64();
    println!(
        "{}, {}, {:.6}, {:.6}, {:.6}, {:.6}",
        length,
        messages,
        start_wall,
        unix_seconds(),
        seconds,
        sum as f64 / seconds.max(f64::EPSILON) / 1024.0
    );
    let _ = sctp::close(fd);
}

fn main() {
    let matches = Command::new("tsctp")
        .about("SCTP throughput test over the userland sockets API")
        .arg(
            Arg::new("local")
                .short('L')
                .takes_value(true)
                .help("Local address"),
        )
        .arg(Arg::new("port").short('p').takes_value(true).help("Port"))
        .arg(
            Arg::new("length")
                .short('l')
                .takes_value(true)
                .help("Size of send/receive buffer"),
        )
        .arg(
            Arg::new("number")
                .short('n')
                .takes_value(true)
                .help("Number of messages sent (0 means infinite)/received"),
        )
        .arg(
            Arg::new("nodelay")
                .short('D')
                .takes_value(false)
                .help("Turns Nagle off"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .takes_value(false)
                .help("Verbose"),
        )
        .arg(
            Arg::new("very-verbose")
                .short('V')
                .takes_value(false)
                .help("Very verbose"),
        )
        .arg(Arg::new("target").takes_value(true).help("Target address"))
        .get_matches();

    let port: u16 = matches
        .value_of("port")
        .map(|p| p.parse().unwrap_or(DEFAULT_PORT))
        .unwrap_or(DEFAULT_PORT);
    let length: usize = matches
        .value_of("length")
        .map(|l| l.parse().unwrap_or(DEFAULT_LENGTH))
        .unwrap_or(DEFAULT_LENGTH);
    let number_of_messages: u64 = matches
        .value_of("number")
        .map(|n| n.parse().unwrap_or(DEFAULT_NUMBER_OF_MESSAGES))
        .unwrap_or(DEFAULT_NUMBER_OF_MESSAGES);
    let nodelay = matches.is_present("nodelay");
    let very_verbose = matches.is_present("very-verbose");
    let verbose = matches.is_present("verbose") || very_verbose;
    let local = matches.value_of("local").unwrap_or("0.0.0.0");
    let target = matches.value_of("target");

    if !sctp::sctp_isavailable() {
        eprintln!("tsctp: SCTP is not available");
        exit(1);
    }

    let fd = match sctp::socket(libc::AF_INET, libc::SOCK_STREAM, libc::IPPROTO_SCTP) {
        Ok(fd) => fd,
        Err(e) => {
            eprintln!("socket: {e}");
            exit(1);
        }
    };

    match target {
        // ====== Server mode =============================================
        None => {
            let local = match SocketAddress::parse(local, port) {
                Ok(address) => address,
                Err(e) => {
                    eprintln!("bad local address: {e}");
                    exit(1);
                }
            };
            if let Err(e) = sctp::bindx(fd, &[local], BindxFlags::AddAddr) {
                eprintln!("bind: {e}");
                exit(1);
            }
            if let Err(e) = sctp::listen(fd, 1) {
                eprintln!("listen: {e}");
                exit(1);
            }
            loop {
                match sctp::accept(fd) {
                    Ok((connection, peers)) => {
                        let peer = peers.into_iter().next();
                        thread::spawn(move || handle_connection(connection, verbose, peer));
                    }
                    Err(e) => {
                        eprintln!("accept: {e}");
                        exit(1);
                    }
                }
            }
        }

        // ====== Client mode =============================================
        Some(target) => {
            let remote = match SocketAddress::parse(target, port) {
                Ok(address) => address,
                Err(e) => {
                    eprintln!("bad target address: {e}");
                    exit(1);
                }
            };
            if let Err(e) = sctp::connect(fd, &remote) {
                eprintln!("connect: {e}");
                exit(1);
            }
            if nodelay {
                if let Err(e) = sctp::setsockopt(fd, SocketOption::SctpNodelay(true)) {
                    eprintln!("setsockopt: nodelay: {e}");
                }
            }

            let buffer = vec![0u8; length];
            let start = Instant::now();
            if verbose {
                print!("Start sending {number_of_messages} messages...");
            }
            let mut i: u64 = 0;
            while number_of_messages == 0 || i < number_of_messages {
                i += 1;
                if very_verbose {
                    println!("Sending message number {i}.");
                }
                if let Err(e) = sctp::send(fd, &buffer, 0) {
                    eprintln!("send: {e}");
                    exit(1);
                }
            }
            if verbose {
                println!("done.");
            }
            let linger = Linger {
                onoff: true,
                seconds: LINGER_TIME,
            };
            if let Err(e) = sctp::setsockopt(fd, SocketOption::Linger(linger)) {
                eprintln!("setsockopt: {e}");
            }
            let _ = sctp::close(fd);

            let seconds = start.elapsed().as_secs_f64();
            println!(
                "Sending of {number_of_messages} messages of length {length} took {seconds:.6} seconds."
            );
            let throughput =
                (number_of_messages * length as u64) as f64 / seconds.max(f64::EPSILON) / 1024.0;
            println!("Throughput was {throughput:.6} KB/sec.");
        }
    }
}
