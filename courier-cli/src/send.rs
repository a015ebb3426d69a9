use courier_http::HttpSender;
use courier_mesh::{Envelope, Sender};
use std::process::ExitCode;
use std::time::Duration;

use crate::{CliError, SendArgs};

/// POST one envelope and print the endpoint's answer
///
/// Exits non-zero when the endpoint answers outside 2xx.
pub async fn run(args: SendArgs) -> Result<ExitCode, CliError> {
    let envelope = Envelope::parse(&args.source, &args.to, args.content, &args.message_type)?;
    let sender = HttpSender::new(args.url, Duration::from_secs(args.timeout_secs))?;

    let delivery = sender.send(&envelope).await?;
    println!("{}", delivery.status);
    if !delivery.body.is_empty() {
        println!("{}", delivery.body);
    }

    Ok(if delivery.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
