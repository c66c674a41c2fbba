//! Interactive `craft-code configure`
//!
//! Walks through picking a provider, endpoint and model, and asks for an API
//! key only when the endpoint is not on this machine.

use crate::config::{is_local_endpoint, Config, ProviderConfig, API_KEY_ENV};
use anyhow::Context;
use std::io::{self, BufRead, Write};

/// Run the prompts on the terminal and save the result.
pub fn run_configure() -> anyhow::Result<()> {
    let mut config = Config::load();
    let stdin = io::stdin();
    let mut input = stdin.lock();
    let mut out = io::stdout();

    if !configure(&mut config, &mut input, &mut out)? {
        writeln!(out, "\n  Nothing saved.")?;
        return Ok(());
    }

    let path = config.save()?;
    writeln!(out)?;
    writeln!(out, "  ✓ Saved provider '{}'", config.provider)?;
    writeln!(out, "  ✓ Config location: {}", path.display())?;
    writeln!(out)?;
    Ok(())
}

/// Update `config` from answers read on `input`.
///
/// Returns false if the user backed out. Empty answers keep the value shown
/// in brackets.
pub fn configure(
    config: &mut Config,
    input: &mut impl BufRead,
    out: &mut impl Write,
) -> anyhow::Result<bool> {
    writeln!(out)?;
    writeln!(out, "  ─────────────────────────────────────────────────────────────────")?;
    writeln!(out, "  craft-code setup")?;
    writeln!(out, "  ─────────────────────────────────────────────────────────────────")?;
    writeln!(out)?;

    let names: Vec<String> = config.models.keys().cloned().collect();
    for (i, name) in names.iter().enumerate() {
        let provider = &config.models[name];
        let marker = if *name == config.provider { "*" } else { " " };
        writeln!(
            out,
            "   {marker}[{}] {name:<12} {} ({})",
            i + 1,
            provider.base_url,
            provider.model
        )?;
    }
    writeln!(out, "    [n] new provider")?;
    writeln!(out, "    [q] quit without saving")?;
    writeln!(out)?;

    let name = loop {
        let Some(answer) = ask(input, out, "Provider", &config.provider)? else {
            return Ok(false);
        };
        match answer.as_str() {
            "q" => return Ok(false),
            "n" => {
                let Some(name) = ask(input, out, "Name for the new provider", "")? else {
                    return Ok(false);
                };
                if name.is_empty() || name.contains(char::is_whitespace) {
                    writeln!(out, "  Provider names must be non-empty with no spaces.")?;
                    continue;
                }
                break name;
            }
            other => {
                if let Some(name) = pick(&names, other) {
                    break name;
                }
                writeln!(out, "  Enter a number from the list, a provider name, n or q.")?;
            }
        }
    };

    let current = config.models.get(&name).cloned().unwrap_or(ProviderConfig {
        base_url: "http://localhost:8080/v1".to_string(),
        model: String::new(),
        api_key: None,
    });

    let base_url = loop {
        let Some(url) = ask(input, out, "Base URL", &current.base_url)? else {
            return Ok(false);
        };
        match url::Url::parse(&url) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => break url,
            _ => writeln!(out, "  Enter an http:// or https:// URL.")?,
        }
    };

    let model = loop {
        let Some(model) = ask(input, out, "Model", &current.model)? else {
            return Ok(false);
        };
        if !model.is_empty() {
            break model;
        }
        writeln!(out, "  A model name is required.")?;
    };

    let mut api_key = current.api_key.clone();
    if is_local_endpoint(&base_url) {
        writeln!(out, "  Local endpoint, no API key needed.")?;
    } else {
        let shown = if api_key.is_some() { "keep current" } else { "none" };
        writeln!(out, "  Keys can also come from ${API_KEY_ENV} at runtime.")?;
        let Some(key) = ask(input, out, "API key", shown)? else {
            return Ok(false);
        };
        if key != shown {
            api_key = Some(key).filter(|k| !k.is_empty());
        }
    }

    config.models.insert(
        name.clone(),
        ProviderConfig {
            base_url,
            model,
            api_key,
        },
    );
    config.provider = name;
    Ok(true)
}

/// Resolve a menu answer to a provider name.
fn pick(names: &[String], answer: &str) -> Option<String> {
    if let Ok(n) = answer.parse::<usize>() {
        return n.checked_sub(1).and_then(|i| names.get(i)).cloned();
    }
    names.iter().find(|name| name.as_str() == answer).cloned()
}

/// Prompt once. `None` means input ended.
fn ask(
    input: &mut impl BufRead,
    out: &mut impl Write,
    label: &str,
    default: &str,
) -> anyhow::Result<Option<String>> {
    if default.is_empty() {
        write!(out, "  {label}: ")?;
    } else {
        write!(out, "  {label} [{default}]: ")?;
    }
    out.flush()?;

    let mut line = String::new();
    let read = input.read_line(&mut line).context("failed to read answer")?;
    if read == 0 {
        return Ok(None);
    }
    let answer = line.trim();
    Ok(Some(if answer.is_empty() {
        default.to_string()
    } else {
        answer.to_string()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    fn run(config: &mut Config, answers: &str) -> (bool, String) {
        let mut input = Cursor::new(answers.as_bytes().to_vec());
        let mut out = Vec::new();
        let saved = configure(config, &mut input, &mut out).unwrap();
        (saved, String::from_utf8(out).unwrap())
    }

    #[test]
    fn test_defaults_keep_local_provider() {
        let mut config = Config::default();
        let before = config.clone();
        let (saved, out) = run(&mut config, "\n\n\n");
        assert!(saved);
        assert!(out.contains("no API key needed"));
        assert_eq!(config, before);
    }

    #[test]
    fn test_pick_by_number_and_set_key() {
        let mut config = Config::default();
        let names: Vec<_> = config.models.keys().cloned().collect();
        let openai = names.iter().position(|n| n == "openai").unwrap() + 1;

        let (saved, _) = run(&mut config, &format!("{openai}\n\ngpt-test\nsk-abc\n"));
        assert!(saved);
        assert_eq!(config.provider, "openai");
        let provider = &config.models["openai"];
        assert_eq!(provider.model, "gpt-test");
        assert_eq!(provider.api_key.as_deref(), Some("sk-abc"));
    }

    #[test]
    fn test_new_provider_with_retry_on_bad_url() {
        let mut config = Config::default();
        let (saved, out) = run(
            &mut config,
            "n\nvllm\nnot a url\nhttp://127.0.0.1:8000/v1\nmy-model\n",
        );
        assert!(saved);
        assert!(out.contains("Enter an http:// or https:// URL."));
        assert_eq!(config.provider, "vllm");
        assert_eq!(config.models["vllm"].base_url, "http://127.0.0.1:8000/v1");
        assert_eq!(config.models["vllm"].api_key, None);
    }

    #[test]
    fn test_quit_and_eof_leave_config_untouched() {
        let mut config = Config::default();
        let before = config.clone();
        assert!(!run(&mut config, "q\n").0);
        assert!(!run(&mut config, "openai\nhttps://api.openai.com/v1\n").0);
        assert_eq!(config, before);
    }

    #[test]
    fn test_pick() {
        let names = vec!["a".to_string(), "b".to_string()];
        assert_eq!(pick(&names, "2"), Some("b".to_string()));
        assert_eq!(pick(&names, "0"), None);
        assert_eq!(pick(&names, "a"), Some("a".to_string()));
        assert_eq!(pick(&names, "zzz"), None);
    }
}
