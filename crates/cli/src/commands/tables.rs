//! The `tables` command - loads and prints the rule tables.

use crate::config;
use clap::Args;
use econet_net::GatewayTables;
use std::path::PathBuf;

#[derive(Args)]
pub struct TablesArgs {
    /// Path to configuration file
    #[arg(long, short)]
    config: PathBuf,

    /// Output in JSON format
    #[arg(long)]
    json: bool,
}

pub fn run(args: TablesArgs) -> anyhow::Result<()> {
    let config = config::load(&args.config)?;
    let tables = GatewayTables::load(&config.tables)?;

    if args.json {
        print!("{}", render_json(&tables));
    } else {
        print!("{}", render_text(&tables));
    }
    Ok(())
}

fn render_text(tables: &GatewayTables) -> String {
    let mut out = String::new();

    out.push_str("Interfaces:\n");
    if tables.interfaces.is_empty() {
        out.push_str("  (none)\n");
    }
    for entry in tables.interfaces.entries() {
        out.push_str(&format!(
            "  {:<8} {:<16} {}\n",
            entry.econet_addr().to_string(),
            entry.ip.to_string(),
            entry.subnet
        ));
    }

    out.push_str("\nRoutes:\n");
    if tables.routes.is_empty() {
        out.push_str("  (none)\n");
    }
    for route in tables.routes.entries() {
        out.push_str(&format!(
            "  {:<19} via {:<16} metric {}\n",
            route.subnet.to_string(),
            route.gateway.to_string(),
            route.metric
        ));
    }

    out.push_str("\nNAT:\n");
    if tables.nat.is_empty() {
        out.push_str("  (none)\n");
    }
    for rule in tables.nat.rules() {
        out.push_str(&format!(
            "  {}:{} -> {}:{}\n",
            rule.external_ip, rule.external_port, rule.internal_ip, rule.internal_port
        ));
    }

    out
}

fn render_json(tables: &GatewayTables) -> String {
    let interfaces: Vec<String> = tables
        .interfaces
        .entries()
        .iter()
        .map(|entry| {
            format!(
                "    {{ \"network\": {}, \"station\": {}, \"ip\": \"{}\", \"subnet\": \"{}\" }}",
                entry.network, entry.station, entry.ip, entry.subnet
            )
        })
        .collect();
    let routes: Vec<String> = tables
        .routes
        .entries()
        .iter()
        .map(|route| {
            format!(
                "    {{ \"subnet\": \"{}\", \"gateway\": \"{}\", \"metric\": {} }}",
                route.subnet, route.gateway, route.metric
            )
        })
        .collect();
    let nat: Vec<String> = tables
        .nat
        .rules()
        .iter()
        .map(|rule| {
            format!(
                "    {{ \"external_ip\": \"{}\", \"internal_ip\": \"{}\", \"external_port\": {}, \"internal_port\": {} }}",
                rule.external_ip, rule.internal_ip, rule.external_port, rule.internal_port
            )
        })
        .collect();

    format!(
        "{{\n  \"interfaces\": [{}],\n  \"routes\": [{}],\n  \"nat\": [{}]\n}}\n",
        json_list(&interfaces),
        json_list(&routes),
        json_list(&nat)
    )
}

fn json_list(items: &[String]) -> String {
    if items.is_empty() {
        String::new()
    } else {
        format!("\n{}\n  ", items.join(",\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use econet_net::{InterfaceTable, NatTable, RouteTable};

    fn tables() -> GatewayTables {
        GatewayTables {
            interfaces: InterfaceTable::parse("1 254 192.168.1.254 255.255.255.0\n").unwrap(),
            routes: RouteTable::parse("0.0.0.0/0 192.168.1.1\n").unwrap(),
            nat: NatTable::parse("192.168.1.1 192.168.0.1 200 23\n").unwrap(),
        }
    }

    #[test]
    fn text_lists_every_table() {
        let text = render_text(&tables());
        assert!(text.contains("1.254"));
        assert!(text.contains("192.168.1.0/24"));
        assert!(text.contains("0.0.0.0/0"));
        assert!(text.contains("metric 20"));
        assert!(text.contains("192.168.1.1:200 -> 192.168.0.1:23"));
    }

    #[test]
    fn text_marks_empty_tables() {
        let text = render_text(&GatewayTables::default());
        assert_eq!(text.matches("(none)").count(), 3);
    }

    #[test]
    fn json_lists_every_table() {
        let json = render_json(&tables());
        assert!(json.contains("\"subnet\": \"192.168.1.0/24\""));
        assert!(json.contains("\"gateway\": \"192.168.1.1\", \"metric\": 20"));
        assert!(json.contains("\"external_port\": 200, \"internal_port\": 23"));
    }

    #[test]
    fn json_of_empty_tables() {
        assert_eq!(
            render_json(&GatewayTables::default()),
            "{\n  \"interfaces\": [],\n  \"routes\": [],\n  \"nat\": []\n}\n"
        );
    }
}
