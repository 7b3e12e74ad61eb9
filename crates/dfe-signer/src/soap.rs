//! SOAP 1.2 framing shared by the event and distribution services.

pub const SOAP12_NS: &str = "http://www.w3.org/2003/05/soap-envelope";
pub const SOAP_CONTENT_TYPE: &str = "application/soap+xml; charset=utf-8";

/// Wrap `payload` in `<nfeDadosMsg xmlns="{wsdl_ns}">` inside a SOAP 1.2 body.
/// `payload` must already be well-formed XML without a declaration.
pub fn envelope(wsdl_ns: &str, payload: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\
         <soap12:Envelope xmlns:xsi=\"http://www.w3.org/2001/XMLSchema-instance\" \
         xmlns:xsd=\"http://www.w3.org/2001/XMLSchema\" xmlns:soap12=\"{SOAP12_NS}\">\
         <soap12:Body><nfeDadosMsg xmlns=\"{wsdl_ns}\">{payload}</nfeDadosMsg></soap12:Body>\
         </soap12:Envelope>"
    )
}

/// Same framing with an operation wrapper, as the distribution services
/// expect: `<op xmlns="{wsdl_ns}"><{msg}>payload</{msg}></op>`.
pub fn envelope_with_operation(wsdl_ns: &str, operation: &str, msg: &str, payload: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\
         <soap12:Envelope xmlns:xsi=\"http://www.w3.org/2001/XMLSchema-instance\" \
         xmlns:xsd=\"http://www.w3.org/2001/XMLSchema\" xmlns:soap12=\"{SOAP12_NS}\">\
         <soap12:Body><{operation} xmlns=\"{wsdl_ns}\"><{msg}>{payload}</{msg}>\
         </{operation}></soap12:Body></soap12:Envelope>"
    )
}
