//! WS-Management shell protocol
//!
//! Builds the SOAP envelopes of the Windows Remote Shell (WinRS) resource
//! and extracts the few values the session needs from the responses.
//! Requests authenticate with NTLM under the `Negotiate` scheme, or with
//! HTTP basic authentication when the listener allows it.

use crate::error::ScvmmError;
use crate::ntlm::{self, Credentials};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

const NS_DECLARATIONS: &str = concat!(
    r#"xmlns:env="http://www.w3.org/2003/05/soap-envelope" "#,
    r#"xmlns:a="http://schemas.xmlsoap.org/ws/2004/08/addressing" "#,
    r#"xmlns:w="http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd" "#,
    r#"xmlns:p="http://schemas.microsoft.com/wbem/wsman/1/wsman.xsd" "#,
    r#"xmlns:rsp="http://schemas.microsoft.com/wbem/wsman/1/windows/shell""#,
);

const RESOURCE_URI: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";
const ANONYMOUS: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous";

const ACTION_CREATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create";
const ACTION_DELETE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete";
const ACTION_COMMAND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command";
const ACTION_SEND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Send";
const ACTION_RECEIVE: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive";
const ACTION_SIGNAL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Signal";

const SIGNAL_TERMINATE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/terminate";
const STATE_DONE: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Done";

/// Fault code of a Receive that ran into the operation timeout without output
pub const OPERATION_TIMEOUT_CODE: &str = "2150858793";

const MAX_ENVELOPE_SIZE: u32 = 153_600;

/// Output collected by one Receive round-trip
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReceiveOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub done: bool,
}

const SOAP_CONTENT_TYPE: &str = "application/soap+xml;charset=UTF-8";

/// How requests authenticate against the WinRM listener
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AuthMethod {
    /// NTLMv2 under the `Negotiate` HTTP scheme
    #[default]
    Ntlm,
    /// HTTP basic authentication
    Basic,
}

impl std::str::FromStr for AuthMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ntlm" | "negotiate" => Ok(AuthMethod::Ntlm),
            "basic" => Ok(AuthMethod::Basic),
            other => Err(format!("unknown WinRM authentication '{other}' (expected ntlm or basic)")),
        }
    }
}

impl std::fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMethod::Ntlm => write!(f, "ntlm"),
            AuthMethod::Basic => write!(f, "basic"),
        }
    }
}

/// WS-Management endpoint
#[derive(Clone)]
pub struct WsManClient {
    client: Client,
    url: String,
    auth: AuthMethod,
    username: String,
    password: String,
    operation_timeout: Duration,
}

impl std::fmt::Debug for WsManClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsManClient")
            .field("url", &self.url)
            .field("auth", &self.auth)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl WsManClient {
    /// Create a client for `http(s)://<host>:<port>/wsman`
    pub fn new(
        host: &str,
        port: u16,
        https: bool,
        auth: AuthMethod,
        username: &str,
        password: &str,
        operation_timeout: Duration,
    ) -> Result<Self, ScvmmError> {
        let client = Client::builder()
            // The HTTP timeout has to outlast the server side operation timeout
            .timeout(operation_timeout + Duration::from_secs(30))
            // NTLM authenticates the connection, so both legs must share one
            .pool_max_idle_per_host(1)
            .build()?;
        let scheme = if https { "https" } else { "http" };
        Ok(Self {
            client,
            url: format!("{scheme}://{host}:{port}/wsman"),
            auth,
            username: username.to_string(),
            password: password.to_string(),
            operation_timeout,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Create a remote shell, returning its id
    pub async fn create_shell(&self) -> Result<String, ScvmmError> {
        let options = concat!(
            r#"<w:OptionSet>"#,
            r#"<w:Option Name="WINRS_NOPROFILE">TRUE</w:Option>"#,
            r#"<w:Option Name="WINRS_CODEPAGE">65001</w:Option>"#,
            r#"</w:OptionSet>"#,
        );
        let body = concat!(
            "<rsp:Shell>",
            "<rsp:InputStreams>stdin</rsp:InputStreams>",
            "<rsp:OutputStreams>stdout stderr</rsp:OutputStreams>",
            "</rsp:Shell>",
        );
        let response = self.post(ACTION_CREATE, None, options, body).await?;
        shell_id(&response)?
            .ok_or_else(|| ScvmmError::Transport("no ShellId in create response".to_string()))
    }

    /// Start `program` with `arguments` inside the shell, returning the command id
    pub async fn start_command(
        &self,
        shell_id: &str,
        program: &str,
        arguments: &[&str],
    ) -> Result<String, ScvmmError> {
        let options = concat!(
            r#"<w:OptionSet>"#,
            r#"<w:Option Name="WINRS_CONSOLEMODE_STDIN">TRUE</w:Option>"#,
            r#"<w:Option Name="WINRS_SKIP_CMD_SHELL">FALSE</w:Option>"#,
            r#"</w:OptionSet>"#,
        );
        let mut body = format!(
            "<rsp:CommandLine><rsp:Command>{}</rsp:Command>",
            xml_escape(program)
        );
        for argument in arguments {
            body.push_str(&format!("<rsp:Arguments>{}</rsp:Arguments>", xml_escape(argument)));
        }
        body.push_str("</rsp:CommandLine>");
        let response = self.post(ACTION_COMMAND, Some(shell_id), options, &body).await?;
        first_text(&response, "CommandId")?
            .ok_or_else(|| ScvmmError::Transport("no CommandId in command response".to_string()))
    }

    /// Write `input` to the stdin of a running command
    pub async fn send(&self, shell_id: &str, command_id: &str, input: &[u8]) -> Result<(), ScvmmError> {
        let body = format!(
            r#"<rsp:Send><rsp:Stream Name="stdin" CommandId="{}">{}</rsp:Stream></rsp:Send>"#,
            xml_escape(command_id),
            STANDARD.encode(input)
        );
        self.post(ACTION_SEND, Some(shell_id), "", &body).await?;
        Ok(())
    }

    /// Collect pending stdout/stderr of a running command
    ///
    /// A receive that times out without output is reported as an empty
    /// result, not as an error.
    pub async fn receive(&self, shell_id: &str, command_id: &str) -> Result<ReceiveOutput, ScvmmError> {
        let body = format!(
            r#"<rsp:Receive><rsp:DesiredStream CommandId="{}">stdout stderr</rsp:DesiredStream></rsp:Receive>"#,
            xml_escape(command_id)
        );
        match self.post(ACTION_RECEIVE, Some(shell_id), "", &body).await {
            Ok(response) => parse_receive(&response),
            Err(ScvmmError::Fault { code, .. }) if code == OPERATION_TIMEOUT_CODE => {
                Ok(ReceiveOutput::default())
            }
            Err(e) => Err(e),
        }
    }

    /// Send the terminate signal to a command
    pub async fn terminate(&self, shell_id: &str, command_id: &str) -> Result<(), ScvmmError> {
        let body = format!(
            r#"<rsp:Signal CommandId="{}"><rsp:Code>{SIGNAL_TERMINATE}</rsp:Code></rsp:Signal>"#,
            xml_escape(command_id)
        );
        self.post(ACTION_SIGNAL, Some(shell_id), "", &body).await?;
        Ok(())
    }

    /// Delete the remote shell
    pub async fn delete_shell(&self, shell_id: &str) -> Result<(), ScvmmError> {
        self.post(ACTION_DELETE, Some(shell_id), "", "").await?;
        Ok(())
    }

    async fn post(
        &self,
        action: &str,
        shell_id: Option<&str>,
        options: &str,
        body: &str,
    ) -> Result<String, ScvmmError> {
        let envelope = envelope(&self.url, action, shell_id, options, body, self.operation_timeout);
        debug!("WS-Management {} to {}", action.rsplit('/').next().unwrap_or(action), self.url);

        let response = match self.auth {
            AuthMethod::Basic => {
                self.request()
                    .basic_auth(&self.username, Some(&self.password))
                    .body(envelope)
                    .send()
                    .await?
            }
            AuthMethod::Ntlm => self.send_ntlm(envelope).await?,
        };

        let status = response.status();
        let text = response.text().await?;

        if status == StatusCode::UNAUTHORIZED {
            return Err(ScvmmError::Transport(format!(
                "authentication failed for {}",
                self.url
            )));
        }
        if let Some((code, reason)) = parse_fault(&text) {
            return Err(ScvmmError::Fault { code, reason });
        }
        if !status.is_success() {
            return Err(ScvmmError::Transport(format!(
                "unexpected HTTP status {} from {}: {}",
                status,
                self.url,
                text.chars().take(500).collect::<String>()
            )));
        }
        Ok(text)
    }

    fn request(&self) -> RequestBuilder {
        self.client.post(&self.url).header(CONTENT_TYPE, SOAP_CONTENT_TYPE)
    }

    /// NEGOTIATE without a body, then AUTHENTICATE carrying the envelope
    async fn send_ntlm(&self, envelope: String) -> Result<Response, ScvmmError> {
        let negotiate = self
            .request()
            .header(AUTHORIZATION, format!("Negotiate {}", STANDARD.encode(ntlm::negotiate_message())))
            .send()
            .await?;

        if negotiate.status() != StatusCode::UNAUTHORIZED {
            return Ok(negotiate);
        }
        let Some((scheme, token)) = ntlm_challenge(&negotiate) else {
            return Ok(negotiate);
        };
        // Drain the body so the connection goes back to the pool
        negotiate.bytes().await?;

        let challenge = STANDARD
            .decode(token)
            .map_err(|e| ScvmmError::Transport(format!("invalid NTLM challenge encoding: {e}")))
            .and_then(|bytes| ntlm::parse_challenge(&bytes))?;
        let authenticate = ntlm::authenticate_message(
            &Credentials::new(&self.username, &self.password),
            &challenge,
            "",
        )?;

        Ok(self
            .request()
            .header(AUTHORIZATION, format!("{scheme} {}", STANDARD.encode(authenticate)))
            .body(envelope)
            .send()
            .await?)
    }
}

/// Scheme and token of the NTLM challenge in a 401 response
fn ntlm_challenge(response: &Response) -> Option<(&'static str, String)> {
    response
        .headers()
        .get_all(WWW_AUTHENTICATE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(|value| {
            let (scheme, token) = value.trim().split_once(' ')?;
            let scheme = match scheme {
                s if s.eq_ignore_ascii_case("Negotiate") => "Negotiate",
                s if s.eq_ignore_ascii_case("NTLM") => "NTLM",
                _ => return None,
            };
            Some((scheme, token.trim().to_string()))
        })
}

/// Build a complete SOAP envelope
pub fn envelope(
    url: &str,
    action: &str,
    shell_id: Option<&str>,
    options: &str,
    body: &str,
    operation_timeout: Duration,
) -> String {
    let selector = shell_id
        .map(|id| {
            format!(
                r#"<w:SelectorSet><w:Selector Name="ShellId">{}</w:Selector></w:SelectorSet>"#,
                xml_escape(id)
            )
        })
        .unwrap_or_default();

    format!(
        concat!(
            r#"<env:Envelope {ns}>"#,
            "<env:Header>",
            "<a:To>{url}</a:To>",
            r#"<a:ReplyTo><a:Address mustUnderstand="true">{anonymous}</a:Address></a:ReplyTo>"#,
            r#"<w:MaxEnvelopeSize mustUnderstand="true">{max}</w:MaxEnvelopeSize>"#,
            "<a:MessageID>uuid:{id}</a:MessageID>",
            r#"<w:Locale mustUnderstand="false" xml:lang="en-US"/>"#,
            r#"<p:DataLocale mustUnderstand="false" xml:lang="en-US"/>"#,
            "<w:OperationTimeout>PT{timeout}S</w:OperationTimeout>",
            r#"<w:ResourceURI mustUnderstand="true">{resource}</w:ResourceURI>"#,
            r#"<a:Action mustUnderstand="true">{action}</a:Action>"#,
            "{selector}{options}",
            "</env:Header>",
            "<env:Body>{body}</env:Body>",
            "</env:Envelope>",
        ),
        ns = NS_DECLARATIONS,
        url = xml_escape(url),
        anonymous = ANONYMOUS,
        max = MAX_ENVELOPE_SIZE,
        id = Uuid::new_v4().to_string().to_uppercase(),
        timeout = operation_timeout.as_secs(),
        resource = RESOURCE_URI,
        action = action,
        selector = selector,
        options = options,
        body = body,
    )
}

/// Element collected by [`parse_document`]: unescaped attributes and text
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub text: String,
}

impl Element {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

fn xml_error(err: impl std::fmt::Display) -> ScvmmError {
    ScvmmError::Transport(format!("invalid XML in response: {err}"))
}

fn open_element(start: &BytesStart<'_>) -> Result<Element, ScvmmError> {
    let mut attributes = Vec::new();
    for attribute in start.attributes() {
        let attribute = attribute.map_err(xml_error)?;
        let key = String::from_utf8_lossy(attribute.key.local_name().as_ref()).into_owned();
        let value = attribute.unescape_value().map_err(xml_error)?.into_owned();
        attributes.push((key, value));
    }
    Ok(Element {
        name: String::from_utf8_lossy(start.local_name().as_ref()).into_owned(),
        attributes,
        text: String::new(),
    })
}

/// Every element of `xml` in document order, keyed by local name
///
/// Namespace prefixes differ between Windows versions and are dropped.
/// Text belongs to its innermost enclosing element.
pub(crate) fn parse_document(xml: &str) -> Result<Vec<Element>, ScvmmError> {
    let mut reader = Reader::from_str(xml);
    let mut found = Vec::new();
    let mut open: Vec<usize> = Vec::new();

    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(start) => {
                found.push(open_element(&start)?);
                open.push(found.len() - 1);
            }
            Event::Empty(start) => found.push(open_element(&start)?),
            Event::Text(text) => {
                if let Some(&current) = open.last() {
                    found[current].text.push_str(&text.unescape().map_err(xml_error)?);
                }
            }
            Event::CData(data) => {
                if let Some(&current) = open.last() {
                    found[current].text.push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            }
            Event::End(_) => {
                open.pop();
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(found)
}

/// Elements with the given local name
pub(crate) fn elements(xml: &str, local_name: &str) -> Result<Vec<Element>, ScvmmError> {
    Ok(parse_document(xml)?
        .into_iter()
        .filter(|e| e.name == local_name)
        .collect())
}

fn first_text_of(document: &[Element], local_name: &str) -> Option<String> {
    document
        .iter()
        .find(|e| e.name == local_name)
        .map(|e| e.text.trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Trimmed text of the first element with the given local name
pub(crate) fn first_text(xml: &str, local_name: &str) -> Result<Option<String>, ScvmmError> {
    Ok(first_text_of(&parse_document(xml)?, local_name))
}

fn shell_id(xml: &str) -> Result<Option<String>, ScvmmError> {
    let document = parse_document(xml)?;
    Ok(first_text_of(&document, "ShellId").or_else(|| {
        document
            .iter()
            .find(|e| e.name == "Selector" && e.attribute("Name") == Some("ShellId"))
            .map(|e| e.text.trim().to_string())
    }))
}

/// Decode the streams and command state of a ReceiveResponse
pub fn parse_receive(xml: &str) -> Result<ReceiveOutput, ScvmmError> {
    let document = parse_document(xml)?;
    let mut output = ReceiveOutput::default();
    for stream in document.iter().filter(|e| e.name == "Stream") {
        let data = stream.text.trim();
        if data.is_empty() {
            continue;
        }
        let decoded = STANDARD
            .decode(data)
            .map_err(|e| ScvmmError::Transport(format!("invalid base64 in output stream: {e}")))?;
        match stream.attribute("Name") {
            Some("stderr") => output.stderr.extend(decoded),
            _ => output.stdout.extend(decoded),
        }
    }
    output.done = document
        .iter()
        .any(|e| e.name == "CommandState" && e.attribute("State") == Some(STATE_DONE));
    Ok(output)
}

/// Fault code and reason of a SOAP fault response
///
/// Bodies that are not well-formed XML are not faults.
pub fn parse_fault(xml: &str) -> Option<(String, String)> {
    let document = parse_document(xml).ok()?;
    document.iter().find(|e| e.name == "Fault")?;
    let code = document
        .iter()
        .find(|e| e.name == "WSManFault")
        .and_then(|e| e.attribute("Code"))
        .map(str::to_string)
        .or_else(|| first_text_of(&document, "Value"))
        .unwrap_or_default();
    let reason = first_text_of(&document, "Message")
        .or_else(|| first_text_of(&document, "Text"))
        .unwrap_or_else(|| "unknown fault".to_string());
    Some((code, reason))
}

/// Escape text for inclusion in an XML element or attribute
pub fn xml_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_id_from_create_response() {
        let xml = r#"<s:Envelope><s:Body><rsp:Shell xmlns:rsp="x"><rsp:ShellId>11111111-AAAA</rsp:ShellId><rsp:Name>Runspace1</rsp:Name></rsp:Shell></s:Body></s:Envelope>"#;
        assert_eq!(shell_id(xml).unwrap().as_deref(), Some("11111111-AAAA"));

        let selector = r#"<s:Envelope><s:Header/><s:Body><x:ResourceCreated><a:ReferenceParameters><w:SelectorSet><w:Selector Name="ShellId">22222222-BBBB</w:Selector></w:SelectorSet></a:ReferenceParameters></x:ResourceCreated></s:Body></s:Envelope>"#;
        assert_eq!(shell_id(selector).unwrap().as_deref(), Some("22222222-BBBB"));
    }

    #[test]
    fn test_parse_receive_streams_and_state() {
        let xml = format!(
            concat!(
                r#"<s:Envelope><s:Body><rsp:ReceiveResponse>"#,
                r#"<rsp:Stream Name="stdout" CommandId="C1">{}</rsp:Stream>"#,
                r#"<rsp:Stream Name="stdout" CommandId="C1">{}</rsp:Stream>"#,
                r#"<rsp:Stream Name="stderr" CommandId="C1">{}</rsp:Stream>"#,
                r#"<rsp:Stream Name="stdout" CommandId="C1" End="true"></rsp:Stream>"#,
                r#"<rsp:CommandState CommandId="C1" State="{}"><rsp:ExitCode>0</rsp:ExitCode></rsp:CommandState>"#,
                r#"</rsp:ReceiveResponse></s:Body></s:Envelope>"#,
            ),
            STANDARD.encode("hello "),
            STANDARD.encode("world"),
            STANDARD.encode("oops"),
            STATE_DONE
        );
        let output = parse_receive(&xml).unwrap();
        assert_eq!(output.stdout, b"hello world");
        assert_eq!(output.stderr, b"oops");
        assert!(output.done);
    }

    #[test]
    fn test_parse_receive_running_state() {
        let xml = r#"<s:Body><rsp:ReceiveResponse><rsp:CommandState CommandId="C1" State="http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Running"/></rsp:ReceiveResponse></s:Body>"#;
        let output = parse_receive(xml).unwrap();
        assert!(output.stdout.is_empty());
        assert!(!output.done);
    }

    #[test]
    fn test_parse_fault_timeout() {
        let xml = r#"<s:Envelope><s:Body><s:Fault><s:Code><s:Value>s:Receiver</s:Value></s:Code><s:Reason><s:Text xml:lang="en-US">The WS-Management service cannot complete the operation within the time specified in OperationTimeout.</s:Text></s:Reason><s:Detail><f:WSManFault xmlns:f="http://schemas.microsoft.com/wbem/wsman/1/wsmanfault" Code="2150858793" Machine="vmm"><f:Message>timed out</f:Message></f:WSManFault></s:Detail></s:Fault></s:Body></s:Envelope>"#;
        let (code, reason) = parse_fault(xml).unwrap();
        assert_eq!(code, OPERATION_TIMEOUT_CODE);
        assert_eq!(reason, "timed out");
        assert!(parse_fault("<s:Envelope><s:Body/></s:Envelope>").is_none());
    }

    #[test]
    fn test_envelope_escapes_and_selects_shell() {
        let xml = envelope(
            "http://vmm:5985/wsman",
            ACTION_SEND,
            Some("S-1"),
            "",
            "<rsp:Send/>",
            Duration::from_secs(60),
        );
        assert!(xml.contains(r#"<w:Selector Name="ShellId">S-1</w:Selector>"#));
        assert!(xml.contains("<w:OperationTimeout>PT60S</w:OperationTimeout>"));
        assert!(xml.contains(ACTION_SEND));
        assert_eq!(xml_escape(r#"a<b>&"c'"#), "a&lt;b&gt;&amp;&quot;c&apos;");
    }

    #[test]
    fn test_parse_fault_decodes_character_references() {
        let xml = concat!(
            r#"<s:Envelope><s:Body><s:Fault><s:Code><s:Value>s:Sender</s:Value></s:Code>"#,
            r#"<s:Detail><f:WSManFault Code="5" Machine="vmm"><f:Message>"#,
            r#"Access is denied.&#xD;&#xA;Check &quot;Allow&quot; &amp; retry&#x2E;</f:Message>"#,
            r#"</f:WSManFault></s:Detail></s:Fault></s:Body></s:Envelope>"#,
        );
        let (code, reason) = parse_fault(xml).unwrap();
        assert_eq!(code, "5");
        assert_eq!(reason, "Access is denied.\r\nCheck \"Allow\" & retry.");
    }

    #[test]
    fn test_parse_document_text_and_cdata() {
        let xml = r#"<a:Root xmlns:a="x"><a:Item Name="one&amp;two">  hello <![CDATA[<raw>]]></a:Item><Empty Flag="1"/></a:Root>"#;
        let document = parse_document(xml).unwrap();
        let names: Vec<&str> = document.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["Root", "Item", "Empty"]);
        assert_eq!(document[1].attribute("Name"), Some("one&two"));
        assert_eq!(document[1].text.trim(), "hello <raw>");
        assert_eq!(document[2].attribute("Flag"), Some("1"));
        assert_eq!(elements(xml, "Item").unwrap().len(), 1);
    }

    #[test]
    fn test_malformed_xml_is_an_error() {
        assert!(parse_receive("<rsp:Stream Name=\"stdout>").is_err());
        assert!(first_text("<a><b>text</a>", "b").is_err());
        assert!(parse_fault("<s:Fault><oops").is_none());
    }

    #[test]
    fn test_auth_method_from_str() {
        assert_eq!("NTLM".parse::<AuthMethod>(), Ok(AuthMethod::Ntlm));
        assert_eq!("negotiate".parse::<AuthMethod>(), Ok(AuthMethod::Ntlm));
        assert_eq!("basic".parse::<AuthMethod>(), Ok(AuthMethod::Basic));
        assert!("kerberos".parse::<AuthMethod>().is_err());
        assert_eq!(AuthMethod::default(), AuthMethod::Ntlm);
        assert_eq!(AuthMethod::Basic.to_string(), "basic");
    }

    mod authentication {
        use super::*;
        use wiremock::matchers::{header_exists, method, path};
        use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

        const CREATED: &str =
            "<s:Envelope><s:Body><rsp:Shell><rsp:ShellId>NTLM-SHELL</rsp:ShellId></rsp:Shell></s:Body></s:Envelope>";

        /// Listener that challenges a NEGOTIATE and accepts an AUTHENTICATE from the CORP domain
        struct NtlmListener;

        impl Respond for NtlmListener {
            fn respond(&self, request: &Request) -> ResponseTemplate {
                let token = request
                    .headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.strip_prefix("Negotiate "))
                    .and_then(|t| STANDARD.decode(t).ok())
                    .unwrap_or_default();
                match token.get(8) {
                    Some(1) if request.body.is_empty() => {
                        let challenge = ntlm::challenge_message([7; 8], &[0, 0, 0, 0]);
                        ResponseTemplate::new(401).insert_header(
                            "WWW-Authenticate",
                            format!("Negotiate {}", STANDARD.encode(challenge)).as_str(),
                        )
                    }
                    Some(3) => {
                        let domain_len = usize::from(u16::from_le_bytes([token[28], token[29]]));
                        let domain_at = u32::from_le_bytes([token[32], token[33], token[34], token[35]]) as usize;
                        let domain = String::from_utf16_lossy(
                            &token[domain_at..domain_at + domain_len]
                                .chunks(2)
                                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                                .collect::<Vec<_>>(),
                        );
                        if domain == "CORP" && !request.body.is_empty() {
                            ResponseTemplate::new(200).set_body_string(CREATED)
                        } else {
                            ResponseTemplate::new(401)
                        }
                    }
                    _ => ResponseTemplate::new(401).insert_header("WWW-Authenticate", "Negotiate"),
                }
            }
        }

        fn client_for(server: &MockServer, auth: AuthMethod) -> WsManClient {
            let address = server.address();
            WsManClient::new(
                &address.ip().to_string(),
                address.port(),
                false,
                auth,
                "CORP\\svc",
                "secret",
                Duration::from_secs(5),
            )
            .unwrap()
        }

        #[tokio::test]
        async fn test_ntlm_handshake_precedes_each_request() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/wsman"))
                .respond_with(NtlmListener)
                .mount(&server)
                .await;

            let client = client_for(&server, AuthMethod::Ntlm);
            assert_eq!(client.create_shell().await.unwrap(), "NTLM-SHELL");

            let requests = server.received_requests().await.unwrap();
            assert_eq!(requests.len(), 2);
            assert!(requests[0].body.is_empty());
            assert!(String::from_utf8_lossy(&requests[1].body).contains("transfer/Create"));
        }

        #[tokio::test]
        async fn test_rejected_ntlm_is_an_authentication_error() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(401).insert_header("WWW-Authenticate", "Negotiate"))
                .mount(&server)
                .await;

            let err = client_for(&server, AuthMethod::Ntlm).create_shell().await.unwrap_err();
            assert!(err.to_string().contains("authentication failed"));
        }

        #[tokio::test]
        async fn test_basic_auth_sends_credentials_once() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(header_exists("authorization"))
                .respond_with(ResponseTemplate::new(200).set_body_string(CREATED))
                .mount(&server)
                .await;

            let client = client_for(&server, AuthMethod::Basic);
            assert_eq!(client.create_shell().await.unwrap(), "NTLM-SHELL");

            let requests = server.received_requests().await.unwrap();
            assert_eq!(requests.len(), 1);
            let header = requests[0].headers.get("authorization").unwrap().to_str().unwrap();
            assert_eq!(header, format!("Basic {}", STANDARD.encode("CORP\\svc:secret")));
        }
    }
}
