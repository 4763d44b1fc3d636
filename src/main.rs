use proxsave::cli::{self, Command};
use proxsave::{collect_all, detect_flavor, exit_code_for, install_ctrlc_cancellation, logging};
use proxsave::config::FlavorKind;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> miette::Result<()> {
	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
		.expect("failed to start tokio runtime")
		.block_on(run())
}

async fn run() -> miette::Result<()> {
	let args = cli::parse();
	let _logging_guard = logging::init(args.verbose, args.log_file.as_deref())?;

	let Command::Run(run_args) = args.command;
	let output = run_args.output.clone();
	let requested_flavor = run_args.flavor;
	let config = run_args.into_collector_config();

	let flavor = match requested_flavor {
		cli::FlavorArg::Pve => FlavorKind::Pve,
		cli::FlavorArg::Pbs => FlavorKind::Pbs,
		cli::FlavorArg::Auto => detect_flavor(&config).await,
	};

	let cancel = install_ctrlc_cancellation();
	let result = collect_all(config, &output, flavor, cancel).await;

	if let Err(report) = &result {
		eprintln!("{report:?}");
	}

	std::process::exit(exit_code_for(&result));
}
