//! Command-line utility to register, browse and resolve DNS-SD services.

use clap::{Args, Parser, Subcommand};
use lantern::{BrowseEvent, Browser, Resolver, Responder, Service};
use std::{net::IpAddr, sync::mpsc, time::Duration};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lantern", version, about = "Register, browse and resolve DNS-SD services")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Advertise a service instance until interrupted
    Register(RegisterArgs),

    /// Continuously browse for instances of a service type
    Browse(BrowseArgs),

    /// Resolve one service instance
    Resolve(ResolveArgs),
}

#[derive(Args)]
struct RegisterArgs {
    /// Service instance name
    #[arg(long)]
    name: String,

    /// Service type, e.g. _http._tcp
    #[arg(long = "type")]
    ty: String,

    /// Service domain
    #[arg(long, default_value = "local")]
    domain: String,

    /// Host name to advertise; defaults to the machine's host name
    #[arg(long)]
    host: Option<String>,

    /// Explicit address to advertise; may be repeated
    #[arg(long)]
    ip: Vec<IpAddr>,

    /// Port the service listens on
    #[arg(long)]
    port: u16,

    /// Restrict to a network interface; may be repeated
    #[arg(long)]
    interface: Vec<String>,
}

#[derive(Args)]
struct BrowseArgs {
    /// Service type, e.g. _http._tcp
    #[arg(long = "type")]
    ty: String,

    /// Service domain
    #[arg(long, default_value = "local")]
    domain: String,

    /// Restrict to a network interface; may be repeated
    #[arg(long)]
    interface: Vec<String>,
}

#[derive(Args)]
struct ResolveArgs {
    /// Service instance name
    #[arg(long)]
    name: String,

    /// Service type, e.g. _http._tcp
    #[arg(long = "type")]
    ty: String,

    /// Service domain
    #[arg(long, default_value = "local")]
    domain: String,

    /// How long to wait, in seconds
    #[arg(long, default_value_t = 5)]
    timeout: u64,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let code = match cli.cmd {
        Cmd::Register(args) => register(args),
        Cmd::Browse(args) => browse(args),
        Cmd::Resolve(args) => resolve(args),
    };

    std::process::exit(code);
}

fn wait_for_interrupt() {
    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        tx.send(()).ok();
    })
    .expect("install SIGINT handler");
    rx.recv().ok();
}

fn register(args: RegisterArgs) -> i32 {
    let mut builder = Service::builder(&args.name, &args.ty, args.port).domain(&args.domain);
    if let Some(host) = &args.host {
        builder = builder.host(host);
    }
    for ip in &args.ip {
        builder = builder.ip(*ip);
    }
    for iface in &args.interface {
        builder = builder.interface(iface);
    }

    let service = match builder.build() {
        Ok(service) => service,
        Err(err) => {
            eprintln!("invalid service: {err}");
            return 1;
        }
    };

    let responder = match Responder::new() {
        Ok(responder) => responder,
        Err(err) => {
            eprintln!("failed to start responder: {err}");
            return 1;
        }
    };

    println!(
        "Registering service {} on port {}",
        service.unescaped_instance_name(),
        service.port()
    );

    let responder = responder.run_in_background();
    let handle = match responder.add(service) {
        Ok(handle) => handle,
        Err(err) => {
            eprintln!("failed to register service: {err}");
            responder.shutdown().ok();
            return 1;
        }
    };

    println!(
        "Registered and active: {}",
        handle.service().unescaped_instance_name()
    );

    wait_for_interrupt();

    println!("Shutting down");
    match responder.shutdown() {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("shutdown failed: {err}");
            1
        }
    }
}

fn browse(args: BrowseArgs) -> i32 {
    let mut builder = Browser::builder(&args.ty).domain(&args.domain);
    for iface in &args.interface {
        builder = builder.interface(iface);
    }

    let browser = match builder.build() {
        Ok(browser) => browser,
        Err(err) => {
            eprintln!("failed to start browser: {err}");
            return 1;
        }
    };

    println!("Browsing for {}.{}.", args.ty, args.domain);
    println!("A/R\tInterface\tDomain\tService Type\tInstance Name");

    let handle = browser.run_in_background(|event| match event {
        BrowseEvent::Added(entry) => {
            println!(
                "Add\t{}\t{}\t{}\t{} {:?}",
                entry.iface, entry.domain, entry.ty, entry.name, entry.ips
            );
        }
        BrowseEvent::Removed(entry) => {
            println!(
                "Rmv\t{}\t{}\t{}\t{}",
                entry.iface, entry.domain, entry.ty, entry.name
            );
        }
    });

    wait_for_interrupt();

    println!("Shutting down");
    match handle.shutdown() {
        Ok(Ok(())) => 0,
        _ => 1,
    }
}

fn resolve(args: ResolveArgs) -> i32 {
    let instance = format!(
        "{}.{}.{}.",
        args.name.trim_matches('.'),
        args.ty.trim_matches('.'),
        args.domain.trim_matches('.')
    );

    println!("Looking up {instance}");

    let resolver = match Resolver::builder()
        .timeout(Duration::from_secs(args.timeout))
        .build()
    {
        Ok(resolver) => resolver,
        Err(err) => {
            eprintln!("failed to start resolver: {err}");
            return 1;
        }
    };

    match resolver.resolve(&instance) {
        Ok(service) => {
            let txt = service
                .txt()
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect::<Vec<_>>()
                .join(" ");
            println!(
                "{} can be reached at {}.{}.:{} {:?} {}",
                service.unescaped_instance_name(),
                service.host(),
                service.domain(),
                service.port(),
                service.ips(),
                txt
            );
            0
        }
        Err(err) => {
            eprintln!("lookup failed: {err}");
            1
        }
    }
}
