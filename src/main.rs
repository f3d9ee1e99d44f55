//! XJP Ops Deploy
//!
//! Usage:
//! - Normal mode: `xjp-ops-deploy`
//! - With custom port: `xjp-ops-deploy --port 19999`

use xjp_ops_deploy::config::env::EnvConfig;

fn print_help() {
    println!("XJP Ops Deploy - 远程部署执行服务");
    println!();
    println!("USAGE:");
    println!("    xjp-ops-deploy [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --port <PORT>    Override the listening port");
    println!("    -h, --help       Print help information");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    xjp_ops_deploy::init_tracing();

    let mut config = EnvConfig::from_env();

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" if i + 1 < args.len() => {
                config.port = args[i + 1]
                    .parse()
                    .map_err(|e| anyhow::anyhow!("Invalid --port value '{}': {}", args[i + 1], e))?;
                i += 2;
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            _ => i += 1,
        }
    }

    xjp_ops_deploy::run_server(config).await
}
