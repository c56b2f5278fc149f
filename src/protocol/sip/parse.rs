use nom::{
    branch::alt,
    bytes::complete::{tag, take_till1, take_until, take_while1},
    character::complete::{digit1, not_line_ending, space0, space1},
    combinator::{map, map_res},
    sequence::{terminated, tuple},
    IResult,
};

use super::message::{SipHeader, SipMessage, SipMethod, SipRequest, SipResponse};
use super::SipParseError;

enum StartLine {
    Request {
        method: SipMethod,
        uri: String,
        version: String,
    },
    Response {
        version: String,
        status: u16,
        reason: String,
    },
}

/// Parses one datagram. The body is cut to `Content-Length` when present.
pub fn parse_sip_message(input: &[u8]) -> Result<SipMessage, SipParseError> {
    let (head, body) = split_head_and_body(input);
    let head = std::str::from_utf8(head).map_err(|_| SipParseError::NotUtf8)?;
    let (start_line, headers) = parse_head(head)?;

    let declared = headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("Content-Length") || h.name == "l")
        .and_then(|h| h.value.trim().parse::<usize>().ok());
    let body = match declared {
        Some(len) if len <= body.len() => body[..len].to_vec(),
        _ => body.to_vec(),
    };

    Ok(match start_line {
        StartLine::Request {
            method,
            uri,
            version,
        } => SipMessage::Request(SipRequest {
            method,
            uri,
            version,
            headers,
            body,
        }),
        StartLine::Response {
            version,
            status,
            reason,
        } => SipMessage::Response(SipResponse {
            version,
            status_code: status,
            reason_phrase: reason,
            headers,
            body,
        }),
    })
}

fn split_head_and_body(input: &[u8]) -> (&[u8], &[u8]) {
    if let Some(pos) = find(input, b"\r\n\r\n") {
        return (&input[..pos], &input[pos + 4..]);
    }
    if let Some(pos) = find(input, b"\n\n") {
        return (&input[..pos], &input[pos + 2..]);
    }
    (input, &[])
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn parse_head(input: &str) -> Result<(StartLine, Vec<SipHeader>), SipParseError> {
    // a lone start line has no trailing newline once the blank line is split off
    let owned;
    let input = if input.contains('\n') {
        input
    } else {
        owned = format!("{}\r\n", input);
        owned.as_str()
    };
    let (rest, start) =
        parse_start_line(input).map_err(|e| SipParseError::StartLine(format!("{:?}", e)))?;
    let headers = parse_headers_block(rest)?;
    Ok((start, headers))
}

fn parse_start_line(input: &str) -> IResult<&str, StartLine> {
    alt((
        map(terminated(parse_status_line, parse_crlf), |v| {
            StartLine::Response {
                version: v.0,
                status: v.1,
                reason: v.2,
            }
        }),
        map(terminated(parse_request_line, parse_crlf), |v| {
            StartLine::Request {
                method: v.0,
                uri: v.1,
                version: v.2,
            }
        }),
    ))(input)
}

fn parse_request_line(input: &str) -> IResult<&str, (SipMethod, String, String)> {
    let (rest, (method_raw, _, uri, _, version)) = tuple((
        take_while1(|c: char| c.is_ascii_alphabetic()),
        space1,
        take_till1(|c| c == ' ' || c == '\r' || c == '\n'),
        space1,
        take_while1(|c: char| c != '\r' && c != '\n'),
    ))(input)?;
    Ok((
        rest,
        (
            SipMethod::from_token(method_raw),
            uri.to_string(),
            version.trim().to_string(),
        ),
    ))
}

fn parse_status_line(input: &str) -> IResult<&str, (String, u16, String)> {
    let (rest, (version, _, code, _, reason)) = tuple((
        tag("SIP/2.0"),
        space1,
        map_res(digit1, |d: &str| d.parse::<u16>()),
        space0,
        not_line_ending,
    ))(input)?;
    Ok((rest, (version.to_string(), code, reason.trim().to_string())))
}

fn parse_headers_block(input: &str) -> Result<Vec<SipHeader>, SipParseError> {
    let mut headers = Vec::new();
    let mut current = String::new();

    for raw_line in input.lines() {
        let line = raw_line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            // folded continuation of the previous header
            if !current.is_empty() {
                current.push(' ');
                current.push_str(line.trim_start());
            }
            continue;
        }
        if !current.is_empty() {
            headers.push(parse_header_line(&current)?);
        }
        current.clear();
        current.push_str(line);
    }
    if !current.is_empty() {
        headers.push(parse_header_line(&current)?);
    }
    Ok(headers)
}

fn parse_header_line(input: &str) -> Result<SipHeader, SipParseError> {
    let res: IResult<&str, (&str, &str, &str, &str)> =
        tuple((take_until(":"), tag(":"), space0, not_line_ending))(input);
    let (_, (name, _, _, value)) = res.map_err(|_| SipParseError::Header(input.to_string()))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(SipParseError::Header(input.to_string()));
    }
    Ok(SipHeader::new(name, value.trim()))
}

fn parse_crlf(input: &str) -> IResult<&str, &str> {
    alt((tag("\r\n"), tag("\n")))(input)
}
