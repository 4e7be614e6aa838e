// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Minimal DER access to certificate fields openssl does not expose.
//!
//! Only two questions are answered here: where is the leaf's OCSP
//! responder (AuthorityInfoAccess), and does the leaf carry the
//! CanSignHttpExchanges extension.

use asn1::ObjectIdentifier;

pub const OID_AUTHORITY_INFO_ACCESS: ObjectIdentifier = asn1::oid!(1, 3, 6, 1, 5, 5, 7, 1, 1);
pub const OID_AD_OCSP: ObjectIdentifier = asn1::oid!(1, 3, 6, 1, 5, 5, 7, 48, 1);
pub const OID_CAN_SIGN_HTTP_EXCHANGES: ObjectIdentifier =
    asn1::oid!(1, 3, 6, 1, 4, 1, 11129, 2, 1, 22);

#[derive(asn1::Asn1Read)]
struct Certificate<'a> {
    tbs: TbsCertificate<'a>,
    _signature_algorithm: asn1::Tlv<'a>,
    _signature: asn1::BitString<'a>,
}

#[derive(asn1::Asn1Read)]
struct TbsCertificate<'a> {
    #[explicit(0)]
    _version: Option<asn1::Tlv<'a>>,
    _serial_number: asn1::Tlv<'a>,
    _signature: asn1::Tlv<'a>,
    _issuer: asn1::Tlv<'a>,
    _validity: asn1::Tlv<'a>,
    _subject: asn1::Tlv<'a>,
    _spki: asn1::Tlv<'a>,
    #[implicit(1)]
    _issuer_unique_id: Option<asn1::BitString<'a>>,
    #[implicit(2)]
    _subject_unique_id: Option<asn1::BitString<'a>>,
    #[explicit(3)]
    extensions: Option<asn1::SequenceOf<'a, Extension<'a>>>,
}

#[derive(asn1::Asn1Read)]
struct Extension<'a> {
    oid: ObjectIdentifier,
    #[default(false)]
    _critical: bool,
    value: &'a [u8],
}

#[derive(asn1::Asn1Read)]
struct AccessDescription<'a> {
    method: ObjectIdentifier,
    // GeneralName; in practice always a uniformResourceIdentifier ([6]).
    #[implicit(6)]
    uri: Option<asn1::IA5String<'a>>,
}

/// The raw value of the extension with `oid`, if the certificate has it.
pub fn extension_value(cert_der: &[u8], oid: ObjectIdentifier) -> anyhow::Result<Option<Vec<u8>>> {
    let cert = asn1::parse_single::<Certificate<'_>>(cert_der)
        .map_err(|e| anyhow::anyhow!("certificate does not parse as DER: {e:?}"))?;
    let Some(extensions) = cert.tbs.extensions else {
        return Ok(None);
    };
    for extension in extensions {
        if extension.oid == oid {
            return Ok(Some(extension.value.to_vec()));
        }
    }
    Ok(None)
}

/// True when the certificate carries the CanSignHttpExchanges extension.
pub fn has_can_sign_http_exchanges(cert_der: &[u8]) -> anyhow::Result<bool> {
    Ok(extension_value(cert_der, OID_CAN_SIGN_HTTP_EXCHANGES)?.is_some())
}

/// The OCSP responder URL from the certificate's AuthorityInfoAccess
/// extension, if present.
pub fn ocsp_responder(cert_der: &[u8]) -> anyhow::Result<Option<String>> {
    let Some(aia) = extension_value(cert_der, OID_AUTHORITY_INFO_ACCESS)? else {
        return Ok(None);
    };
    let descriptions = asn1::parse_single::<asn1::SequenceOf<'_, AccessDescription<'_>>>(&aia)
        .map_err(|e| anyhow::anyhow!("AuthorityInfoAccess does not parse: {e:?}"))?;
    for description in descriptions {
        if description.method == OID_AD_OCSP {
            if let Some(uri) = description.uri {
                return Ok(Some(uri.as_str().to_string()));
            }
        }
    }
    Ok(None)
}
