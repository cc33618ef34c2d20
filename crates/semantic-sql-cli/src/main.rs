use std::io::{self, Read};
use std::process::ExitCode;

use anstyle::{AnsiColor, Effects, Style};
use clap::Parser as _;
use serde_json::json;

use commands::{Cli, Commands, Format, RewriteArgs, SqlArgs};
use semantic_sql::registry::Registry;
use semantic_sql::tracker::{classify_query_type, fingerprint_query};

mod commands;
mod logger;
mod registry_demo;

const HEADER: Style = AnsiColor::Cyan.on_default().effects(Effects::BOLD);

fn heading(label: &str) -> String {
    format!("{}{label}{}", HEADER.render(), HEADER.render_reset())
}

fn main() -> ExitCode {
    let _ = logger::init();
    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Rewrite(args) => run_rewrite(args),
        Commands::Tokenize(args) => run_tokenize(args),
        Commands::Fingerprint(args) => run_fingerprint(args),
    };
    ExitCode::from(code)
}

fn read_sql(arg: &str) -> io::Result<String> {
    if arg == "-" {
        let mut buf = String::new();
        io::stdin().read_to_string(&mut buf)?;
        Ok(buf)
    } else {
        Ok(arg.to_string())
    }
}

fn run_rewrite(args: RewriteArgs) -> u8 {
    let sql = match read_sql(&args.sql) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error reading SQL: {e}");
            return 1;
        }
    };

    let registry = if args.demo_registry { registry_demo::build() } else { Registry::new() };
    let out = semantic_sql::rewrite::pipeline::rewrite(&sql, &registry);

    match args.format {
        Format::Json => {
            let directive = out.directive.map(|d| match d {
                semantic_sql::directive::Directive::Background => json!({"type": "BACKGROUND"}),
                semantic_sql::directive::Directive::Analyze { prompt } => json!({"type": "ANALYZE", "prompt": prompt}),
            });
            println!("{}", json!({"sql": out.sql, "directive": directive}));
        }
        Format::Text => {
            if let Some(directive) = &out.directive {
                println!("{}: {directive:?}", heading("directive"));
            }
            println!("{}:", heading("rewritten"));
            println!("{}", out.sql);
        }
    }
    0
}

fn run_tokenize(args: SqlArgs) -> u8 {
    let sql = match read_sql(&args.sql) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error reading SQL: {e}");
            return 1;
        }
    };
    let tokens = semantic_sql::token::tokenize(&sql);

    match args.format {
        Format::Json => {
            let rows: Vec<_> = tokens.iter().map(|t| json!({"kind": format!("{:?}", t.kind), "lexeme": t.lexeme})).collect();
            println!("{}", json!(rows));
        }
        Format::Text => {
            for tok in &tokens {
                println!("{:<14} {:?}", format!("{:?}", tok.kind), tok.lexeme);
            }
        }
    }
    0
}

fn run_fingerprint(args: SqlArgs) -> u8 {
    let sql = match read_sql(&args.sql) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error reading SQL: {e}");
            return 1;
        }
    };
    let (fingerprint, template, udf_types) = fingerprint_query(&sql);
    let query_type = classify_query_type(&udf_types, &sql);

    match args.format {
        Format::Json => {
            println!("{}", json!({"fingerprint": fingerprint, "template": template, "udf_types": udf_types, "query_type": query_type}));
        }
        Format::Text => {
            println!("{}: {fingerprint}", heading("fingerprint"));
            println!("{}:    {template}", heading("template"));
            println!("{}:   {udf_types:?}", heading("udf_types"));
            println!("{}:  {query_type}", heading("query_type"));
        }
    }
    0
}
