//! `lnlink` command-line client.
//!
//! ```text
//! lnlink [--rune R] [--timeout-ms N] [-k] <node_id@host[:port]> <command> [args...]
//! lnlink decode <bech32>
//! lnlink invoice <bolt11|offer>
//! lnlink lnurl <lnurl>
//! lnlink lnurlp <lnurl> [amount_msat]
//! ```

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use lnlink::bech32;
use lnlink::invoice::{decode_lnurl, parse_invoice, validate_invoice, DecodeType, InvoiceAmount};
use lnlink::lnurl::{fetch_invoice, fetch_pay_request, PayRequest};
use lnlink::rpc::PAY_TIMEOUT;
use lnlink::{ClientBuilder, Error, Result};
use serde_json::{json, Map, Value};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug, Parser)]
#[command(version, about = "Send commando RPCs to a Lightning node", long_about = None)]
struct Args {
    /// Rune authorizing the commands
    #[arg(long, env = "LNLINK_RUNE", default_value = "", hide_env_values = true)]
    rune: String,

    /// Per-request timeout in milliseconds
    #[arg(long, env = "LNLINK_TIMEOUT_MS")]
    timeout_ms: Option<u64>,

    /// Time allowed for connecting and the init exchange, in milliseconds
    #[arg(long, default_value_t = 10_000, env = "LNLINK_CONNECT_TIMEOUT_MS")]
    connect_timeout_ms: u64,

    /// Treat arguments as key=value pairs
    #[arg(short = 'k')]
    keywords: bool,

    /// `<node_id>@<host>[:port]`, or one of `decode`, `invoice`, `lnurl`, `lnurlp`
    target: String,

    /// RPC method, or the string to inspect for local commands
    command: String,

    /// Method arguments; parsed as JSON when possible
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

/// What one invocation does.
#[derive(Debug, PartialEq)]
enum Action {
    Decode(String),
    Invoice(String),
    Lnurl(String),
    LnurlPay {
        lnurl: String,
        amount_msat: Option<u64>,
    },
    Rpc {
        address: String,
        method: String,
        params: Value,
    },
}

fn plan(args: &Args) -> Result<Action> {
    let local = |s: &String| -> Result<String> {
        if !args.args.is_empty() {
            return Err(Error::Invalid(format!(
                "{} takes exactly one argument",
                args.target
            )));
        }
        Ok(s.clone())
    };

    match args.target.as_str() {
        "decode" => Ok(Action::Decode(local(&args.command)?)),
        "invoice" => Ok(Action::Invoice(local(&args.command)?)),
        "lnurl" => Ok(Action::Lnurl(local(&args.command)?)),
        "lnurlp" => {
            let amount_msat = match args.args.as_slice() {
                [] => None,
                [amount] => Some(amount.parse().map_err(|_| {
                    Error::Invalid(format!("amount must be msat, got {:?}", amount))
                })?),
                _ => return Err(Error::Invalid("lnurlp takes an lnurl and an amount".into())),
            };
            Ok(Action::LnurlPay {
                lnurl: args.command.clone(),
                amount_msat,
            })
        }
        address => Ok(Action::Rpc {
            address: address.to_string(),
            method: args.command.clone(),
            params: build_params(&args.args, args.keywords)?,
        }),
    }
}

/// JSON value if `arg` parses as one, else the raw string.
fn parse_arg(arg: &str) -> Value {
    serde_json::from_str(arg).unwrap_or_else(|_| Value::String(arg.to_string()))
}

fn build_params(args: &[String], keywords: bool) -> Result<Value> {
    if !keywords {
        return Ok(Value::Array(args.iter().map(|a| parse_arg(a)).collect()));
    }

    let mut params = Map::new();
    for arg in args {
        let (key, value) = arg
            .split_once('=')
            .ok_or_else(|| Error::Invalid(format!("expected key=value, got {:?}", arg)))?;
        if key.is_empty() {
            return Err(Error::Invalid(format!("empty key in {:?}", arg)));
        }
        params.insert(key.to_string(), parse_arg(value));
    }
    Ok(Value::Object(params))
}

/// The invoice argument of a `pay` call, if present.
fn pay_invoice(params: &Value) -> Option<&str> {
    match params {
        Value::Array(items) => items.first().and_then(Value::as_str),
        Value::Object(map) => map.get("bolt11").and_then(Value::as_str),
        _ => None,
    }
}

fn describe_invoice(kind: DecodeType) -> Value {
    match kind {
        DecodeType::Offer => json!({ "type": "offer" }),
        DecodeType::Invoice(InvoiceAmount::Any) => json!({ "type": "invoice", "amount_msat": "any" }),
        DecodeType::Invoice(InvoiceAmount::Amount(msat)) => {
            json!({ "type": "invoice", "amount_msat": msat })
        }
    }
}

fn describe_pay_request(request: &PayRequest) -> Value {
    json!({
        "callback": request.callback,
        "min_msat": request.min_msat(),
        "max_msat": request.max_msat(),
        "description": request.description(),
        "long_description": request.long_description(),
        "vendor": request.vendor(),
    })
}

/// Fetch the pay request, and an invoice too when an amount is given.
async fn fetch_lnurl_pay(lnurl: &str, amount_msat: Option<u64>) -> Result<Value> {
    let client = reqwest::Client::new();
    let request = fetch_pay_request(&client, lnurl).await?;
    match amount_msat {
        None => Ok(describe_pay_request(&request)),
        Some(amount) => {
            let invoice = fetch_invoice(&client, &request, amount).await?;
            Ok(json!({ "invoice": invoice, "amount_msat": amount }))
        }
    }
}

fn lnurl_pay(lnurl: &str, amount_msat: Option<u64>) -> Result<Value> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(fetch_lnurl_pay(lnurl, amount_msat))
}

fn run(args: Args) -> Result<Value> {
    match plan(&args)? {
        Action::Decode(s) => {
            let decoded = bech32::decode(&s)?;
            Ok(json!({
                "hrp": &decoded.hrp,
                "variant": decoded.variant.to_string(),
                "data": hex::encode(&decoded.bytes),
            }))
        }
        Action::Invoice(s) => Ok(describe_invoice(parse_invoice(&s)?)),
        Action::Lnurl(s) => Ok(json!({ "url": decode_lnurl(&s)? })),
        Action::LnurlPay { lnurl, amount_msat } => lnurl_pay(&lnurl, amount_msat),
        Action::Rpc {
            address,
            method,
            params,
        } => {
            if method == "pay" {
                let invoice = pay_invoice(&params)
                    .ok_or_else(|| Error::Invalid("pay needs a bolt11 invoice".into()))?;
                validate_invoice(invoice)?;
            }

            let timeout = args
                .timeout_ms
                .map(Duration::from_millis)
                .or_else(|| (method == "pay").then_some(PAY_TIMEOUT));

            let session = ClientBuilder::new()
                .rune(args.rune)
                .connect_timeout(Duration::from_millis(args.connect_timeout_ms))
                .connect(&address)?;

            let result = session.call(&method, params, timeout);
            if let Err(e) = session.shutdown() {
                tracing::debug!("Session ended with: {}", e);
            }
            Ok(result?)
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let output = run(args).and_then(|value| Ok(serde_json::to_string_pretty(&value)?));
    match output {
        Ok(text) => {
            println!("{}", text);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(argv: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("lnlink").chain(argv.iter().copied())).unwrap()
    }

    #[test]
    fn test_positional_params() {
        let params = build_params(
            &["42".into(), "label".into(), "[1,2]".into(), "true".into()],
            false,
        )
        .unwrap();
        assert_eq!(params, json!([42, "label", [1, 2], true]));
    }

    #[test]
    fn test_keyword_params() {
        let params = build_params(&["amount_msat=1000".into(), "label=a=b".into()], true).unwrap();
        assert_eq!(params, json!({ "amount_msat": 1000, "label": "a=b" }));

        assert!(matches!(
            build_params(&["nokey".into()], true),
            Err(Error::Invalid(_))
        ));
        assert!(matches!(
            build_params(&["=1".into()], true),
            Err(Error::Invalid(_))
        ));
    }

    #[test]
    fn test_plan_rpc() {
        let parsed = args(&["--rune", "r", "-k", "02aa@host", "invoice", "amount_msat=5", "label=x"]);
        assert_eq!(parsed.rune, "r");
        assert_eq!(
            plan(&parsed).unwrap(),
            Action::Rpc {
                address: "02aa@host".into(),
                method: "invoice".into(),
                params: json!({ "amount_msat": 5, "label": "x" }),
            }
        );
    }

    #[test]
    fn test_plan_hyphen_args() {
        let parsed = args(&["02aa@host", "echo", "-5", "--not-a-flag"]);
        assert_eq!(parsed.args, vec!["-5", "--not-a-flag"]);
    }

    #[test]
    fn test_plan_local_commands() {
        assert_eq!(
            plan(&args(&["decode", "a12uel5l"])).unwrap(),
            Action::Decode("a12uel5l".into())
        );
        assert_eq!(
            plan(&args(&["invoice", "lnbc1x"])).unwrap(),
            Action::Invoice("lnbc1x".into())
        );
        assert!(plan(&args(&["decode", "a", "b"])).is_err());
    }

    #[test]
    fn test_plan_lnurl_pay() {
        assert_eq!(
            plan(&args(&["lnurlp", "lnurl1x"])).unwrap(),
            Action::LnurlPay {
                lnurl: "lnurl1x".into(),
                amount_msat: None,
            }
        );
        assert_eq!(
            plan(&args(&["lnurlp", "lnurl1x", "21000"])).unwrap(),
            Action::LnurlPay {
                lnurl: "lnurl1x".into(),
                amount_msat: Some(21_000),
            }
        );
        assert!(matches!(
            plan(&args(&["lnurlp", "lnurl1x", "21sat"])),
            Err(Error::Invalid(_))
        ));
        assert!(plan(&args(&["lnurlp", "lnurl1x", "1", "2"])).is_err());
    }

    #[test]
    fn test_lnurl_pay_rejects_bad_lnurl_before_fetching() {
        let err = run(args(&["lnurlp", "lnurl1qqqqqq"])).unwrap_err();
        assert!(matches!(err, Error::Lnurl(_)));
    }

    #[test]
    fn test_pay_invoice_lookup() {
        assert_eq!(pay_invoice(&json!(["lnbc1x", "100msat"])), Some("lnbc1x"));
        assert_eq!(pay_invoice(&json!({ "bolt11": "lnbc1y" })), Some("lnbc1y"));
        assert_eq!(pay_invoice(&json!([])), None);
    }

    #[test]
    fn test_pay_rejects_bad_invoice_before_connecting() {
        let parsed = args(&["02aa@unreachable.invalid", "pay", "lnbc2500u1qqqqqq"]);
        assert!(matches!(run(parsed), Err(Error::Invoice(_))));
    }

    #[test]
    fn test_run_local_invoice() {
        let value = run(args(&["invoice", "lnbc2500u1pvjluez"])).unwrap();
        assert_eq!(value, json!({ "type": "invoice", "amount_msat": 250_000_000u64 }));

        let value = run(args(&["invoice", "lno1qcp4256ypq"])).unwrap();
        assert_eq!(value, json!({ "type": "offer" }));
    }

    #[test]
    fn test_run_decode() {
        let value = run(args(&["decode", "A12UEL5L"])).unwrap();
        assert_eq!(value, json!({ "hrp": "a", "variant": "bech32", "data": "" }));
    }
}
