use tokensigner::cli::options::Options;

#[tokio::main]
async fn main() {
    let options = Options::from_args();
    let client = options.client();
    let format = options.general.format;
    let report = options.command.run(&client).await;
    std::process::exit(report.print(format));
}
