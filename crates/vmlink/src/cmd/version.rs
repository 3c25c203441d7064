use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("vmlink {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: vmlink");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!("target: {}", option_env!("VMLINK_BUILD_TARGET").unwrap_or("unknown"));
    println!("profile: {}", option_env!("VMLINK_BUILD_PROFILE").unwrap_or("unknown"));
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!("features: cli={}", cfg!(feature = "cli"));

    Ok(SUCCESS)
}
