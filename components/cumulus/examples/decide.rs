/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Decide a flag for a user against a local datafile:
//!
//!     cargo run --example decide -- datafile.json my_flag my_user

use cumulus::{ClientOptions, CumulusClient, DecideOption};
use std::collections::HashMap;

fn main() -> cumulus::Result<()> {
    env_logger::init();
    let mut args = std::env::args().skip(1);
    let (Some(datafile_path), Some(flag_key), Some(user_id)) =
        (args.next(), args.next(), args.next())
    else {
        eprintln!("usage: decide <datafile.json> <flag-key> <user-id>");
        std::process::exit(2);
    };

    let client = CumulusClient::new(ClientOptions {
        datafile: Some(std::fs::read_to_string(datafile_path)?),
        ..Default::default()
    })?;

    let ctx = client.create_user_context(&user_id, HashMap::new());
    let decision = ctx.decide(&flag_key, &[DecideOption::IncludeReasons]);

    println!(
        "{}: enabled={} variation={:?} rule={:?}",
        decision.flag_key, decision.enabled, decision.variation_key, decision.rule_key
    );
    for (key, value) in &decision.variables {
        println!("  {} = {}", key, value);
    }
    for reason in &decision.reasons {
        println!("  - {}", reason);
    }

    client.close(None);
    Ok(())
}
