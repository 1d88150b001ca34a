use clap::Parser;
use tracing_log::log::debug;
use vmkit_runtime::{VmConfig, start};

#[derive(Parser, Debug)]
#[command(version, about = "vmkit launcher: runs a main class on the managed runtime")]
pub struct Args {
    #[arg(
        short = 'j',
        long = "java",
        help = "Main class to run, in dotted or internal form \
                (e.g. com.example.Main or com/example/Main)"
    )]
    pub main_class: String,
    #[arg(
        long = "heap-mb",
        default_value_t = 64,
        help = "Heap segment size in megabytes"
    )]
    pub heap_mb: usize,
    #[arg(
        long = "inline-caches",
        help = "Dispatch interface calls through envelope inline caches \
                instead of the interface method table"
    )]
    pub inline_caches: bool,
    #[arg(help = "Arguments passed to the guest main method")]
    pub guest_args: Vec<String>,
}

fn main() {
    #[cfg(feature = "log-runtime-traces")]
    {
        use tracing_subscriber::EnvFilter;
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .init();
        tracing_log::LogTracer::init().expect("log tracer");
    }
    let args = Args::parse();
    debug!("Provided command line arguments: {:?}", args);

    let config = VmConfig {
        main_class: args.main_class.replace('.', "/"),
        boot_class_path: std::env::var("VMKIT_BOOTCLASSPATH").ok(),
        heap_size_mb: args.heap_mb,
        use_inline_caches: args.inline_caches,
        ..VmConfig::default()
    };

    // Class bytes come from an embedder-supplied reader; the bare launcher
    // wires only the bootstrap provider.
    match start(config, None, &args.guest_args) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("vmkit: {}", e);
            std::process::exit(1);
        }
    }
}
