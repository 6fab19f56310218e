use super::{AlertMessage, DeliveryError, MessageHandle};
use crate::keys::SubscriberId;
use anyhow::Context;

const LAUNCH_URL: &str = "https://ingress.com/launchapp";

/// Delivers notifications as HTML-formatted messages of the Telegram Bot API.
pub struct TelegramNotifier {
    http_client: reqwest::Client,
    // Base URL of bot methods, including the bot token.
    base: url::Url,
}

impl std::fmt::Debug for TelegramNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramNotifier")
            .field("api", &self.base.origin().ascii_serialization())
            .finish()
    }
}

#[derive(Debug, serde::Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    error_code: Option<u16>,
    #[serde(default)]
    description: String,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, serde::Deserialize)]
struct ResponseParameters {
    migrate_to_chat_id: Option<i64>,
    retry_after: Option<u64>,
}

#[derive(Debug, serde::Deserialize)]
struct SentMessage {
    message_id: i64,
}

impl TelegramNotifier {
    pub fn new(
        api: &url::Url,
        bot_token: &str,
        http_client: reqwest::Client,
    ) -> anyhow::Result<Self> {
        let base = api
            .join(&format!("bot{bot_token}/"))
            .context("building Telegram bot API URL")?;

        Ok(Self { http_client, base })
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<T, DeliveryError> {
        let url = self
            .base
            .join(method)
            .map_err(|err| DeliveryError::Transient(format!("building {method} URL: {err}")))?;

        let response = self.http_client.post(url).json(&body).send().await?;
        let status = response.status();

        let response: ApiResponse<T> = response.json().await.map_err(|err| {
            DeliveryError::Transient(format!("decoding {method} response ({status}): {err}"))
        })?;

        match response {
            ApiResponse {
                ok: true,
                result: Some(result),
                ..
            } => Ok(result),
            ApiResponse {
                error_code,
                description,
                parameters,
                ..
            } => {
                let code = error_code.unwrap_or(status.as_u16());
                if let Some(retry_after) = parameters.as_ref().and_then(|p| p.retry_after) {
                    tracing::debug!(%method, retry_after, "Telegram API is rate limiting");
                }
                Err(classify(
                    code,
                    &description,
                    parameters.and_then(|p| p.migrate_to_chat_id),
                ))
            }
        }
    }

    pub async fn create(
        &self,
        subscriber: &SubscriberId,
        message: &AlertMessage,
    ) -> Result<MessageHandle, DeliveryError> {
        let sent: SentMessage = self
            .call(
                "sendMessage",
                serde_json::json!({
                    "chat_id": subscriber.as_str(),
                    "text": format_html(message),
                    "parse_mode": "HTML",
                }),
            )
            .await?;

        tracing::debug!(%subscriber, message_id = sent.message_id, "sent alert message");
        Ok(MessageHandle::new(sent.message_id.to_string()))
    }

    pub async fn edit(
        &self,
        subscriber: &SubscriberId,
        handle: &MessageHandle,
        message: &AlertMessage,
    ) -> Result<(), DeliveryError> {
        let message_id: i64 = handle.as_str().parse().map_err(|_| {
            DeliveryError::Transient(format!("invalid Telegram message handle {handle:?}"))
        })?;

        let result = self
            .call::<serde_json::Value>(
                "editMessageText",
                serde_json::json!({
                    "chat_id": subscriber.as_str(),
                    "message_id": message_id,
                    "text": format_html(message),
                    "parse_mode": "HTML",
                }),
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            // The message already shows this content.
            Err(DeliveryError::Transient(description))
                if description.contains("message is not modified") =>
            {
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

/// Classify a failed Bot API call by its error code and description.
pub fn classify(code: u16, description: &str, migrate_to: Option<i64>) -> DeliveryError {
    if let Some(to) = migrate_to {
        return DeliveryError::Migrated(SubscriberId::new(to.to_string()));
    }

    let lowered = description.to_lowercase();
    let gone = [
        "chat not found",
        "bot was blocked by the user",
        "bot was kicked",
        "user is deactivated",
        "bot is not a member",
        "group chat was deleted",
    ];

    if code == 403 || (code == 400 && gone.iter().any(|needle| lowered.contains(needle))) {
        DeliveryError::Permanent(format!("{code}: {description}"))
    } else {
        DeliveryError::Transient(format!("{code}: {description}"))
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

/// Format an AlertMessage using the Bot API's HTML dialect.
///
/// The message opens with an invisible anchor to the asset image, which
/// Telegram renders as a link preview.
pub fn format_html(message: &AlertMessage) -> String {
    let AlertMessage {
        asset_name,
        address: _,
        city,
        image,
        key,
        summary,
    } = message;

    let pll = format!("{:.6},{:.6}", key.latitude(), key.longitude());
    let intel = format!("https://intel.ingress.com/intel?z=17&amp;pll={pll}");

    let mut text = String::new();
    if let Some(image) = image {
        text.push_str(&format!("<a href=\"{}\">&#8203;</a>", escape(image)));
    }
    text.push_str(&format!(
        "<a href=\"{LAUNCH_URL}\"><b>{}</b></a> @ <a href=\"{intel}\">{}</a>",
        escape(asset_name),
        escape(city),
    ));

    let attackers: Vec<String> = summary
        .attackers
        .iter()
        .map(|name| format!("<b>{}</b>", escape(name)))
        .collect();
    text.push_str(&format!("\nattacked by {}", attackers.join(", ")));

    if !summary.destroyed.is_empty() {
        let clauses: Vec<String> = summary
            .destroyed
            .iter()
            .map(|d| format!("<b>{}</b> {}", d.count, d.noun()))
            .collect();
        text.push_str(&format!("\n{} destroyed", clauses.join(", ")));
    }

    match summary.neutralized {
        crate::render::Neutralized::Never => (),
        crate::render::Neutralized::Once => text.push_str("\nneutralized"),
        crate::render::Neutralized::Times(n) => {
            text.push_str(&format!("\nneutralized <b>{n}</b> times"))
        }
    }
    text
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::render::Summary;
    use crate::tally::Tally;

    #[test]
    fn test_classify() {
        assert!(matches!(
            classify(400, "Bad Request: chat not found", None),
            DeliveryError::Permanent(_)
        ));
        assert!(matches!(
            classify(403, "Forbidden: bot was blocked by the user", None),
            DeliveryError::Permanent(_)
        ));
        assert!(matches!(
            classify(429, "Too Many Requests: retry after 5", None),
            DeliveryError::Transient(_)
        ));
        // Malformed requests are not the subscriber's fault.
        assert!(matches!(
            classify(400, "Bad Request: can't parse entities", None),
            DeliveryError::Transient(_)
        ));
        assert!(matches!(
            classify(400, "Bad Request: group chat was upgraded to a supergroup chat", Some(-1001234)),
            DeliveryError::Migrated(to) if to.as_str() == "-1001234"
        ));
    }

    #[test]
    fn test_format_html() {
        let report = crate::report::test::fixture();
        let tally = Tally {
            attackers: ["raider", "<looter>"].into_iter().map(String::from).collect(),
            resonators: 12,
            mods: 1,
            links: 2,
            neutralized: 2,
        };
        let message = AlertMessage::new(&report.assets["p1"], Summary::from_tally(&tally));

        insta::assert_snapshot!(format_html(&message), @r###"
        <a href="https://lh3.googleusercontent.com/eiffel">&#8203;</a><a href="https://ingress.com/launchapp"><b>Tour Eiffel</b></a> @ <a href="https://intel.ingress.com/intel?z=17&amp;pll=48.858370,2.294481">Paris</a>
        attacked by <b>&lt;looter&gt;</b>, <b>raider</b>
        <b>8+</b> resonators, <b>1</b> mod, <b>2</b> links destroyed
        neutralized <b>2</b> times
        "###);

        insta::assert_snapshot!(message.to_text(), @r###"
        Tour Eiffel @ Paris
        attacked by <looter>, raider
        8+ resonators, 1 mod, 2 links destroyed
        neutralized 2 times
        "###);
    }
}
