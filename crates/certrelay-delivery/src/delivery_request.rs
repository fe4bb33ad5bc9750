//! Inbound delivery request model and the document it becomes.

use certrelay_session::{DocumentMessage, RecipientAddress, USER_ADDRESS_SUFFIX};
use serde::{Deserialize, Serialize};

pub const PDF_MIME_TYPE: &str = "application/pdf";
pub const DEFAULT_DOCUMENT_NAME: &str = "certificate";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Body of `POST /send-certificate`. Absent or null fields deserialize as `None`.
pub struct DeliveryRequest {
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub pdf_url: Option<String>,
}

impl DeliveryRequest {
    pub fn new(phone: impl Into<String>, name: Option<&str>, pdf_url: impl Into<String>) -> Self {
        Self {
            phone: Some(phone.into()),
            name: name.map(str::to_string),
            pdf_url: Some(pdf_url.into()),
        }
    }

    /// Phone and document URL, when both are present and non-empty.
    pub fn required_fields(&self) -> Option<(&str, &str)> {
        let phone = self.phone.as_deref().filter(|phone| !phone.is_empty())?;
        let pdf_url = self.pdf_url.as_deref().filter(|url| !url.is_empty())?;
        Some((phone, pdf_url))
    }

    pub fn display_name(&self) -> Option<&str> {
        self.name.as_deref().filter(|name| !name.is_empty())
    }
}

/// Strips every non-digit character and appends the user address suffix.
///
/// Digit count and country code are not validated; the network rejects bad
/// numbers at send time.
pub fn normalize_recipient_address(phone: &str) -> RecipientAddress {
    let digits = phone
        .chars()
        .filter(char::is_ascii_digit)
        .collect::<String>();
    RecipientAddress::new(format!("{digits}{USER_ADDRESS_SUFFIX}"))
}

pub fn build_certificate_document(display_name: Option<&str>, pdf_url: &str) -> DocumentMessage {
    let file_stem = display_name.unwrap_or(DEFAULT_DOCUMENT_NAME);
    let greeting_name = display_name.unwrap_or_default();
    DocumentMessage {
        url: pdf_url.to_string(),
        mime_type: PDF_MIME_TYPE.to_string(),
        file_name: format!("{file_stem}.pdf"),
        caption: format!("🎉 Hello {greeting_name}!\n\nYour certificate is ready ✅"),
    }
}
